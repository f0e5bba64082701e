//! Job retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::duration_millis;

/// Bounded retry with exponential backoff for queued delivery jobs
///
/// `max_attempts` counts every try, including the first, and must match the
/// delivery attempt ceiling so a job is exhausted exactly when its attempt
/// row goes `dead`.
///
/// Jitter only shortens delays: a delay `d` with jitter `j` lands uniformly
/// in `[d * (1 - j), d]`.
///
/// With the defaults, retries land roughly 2s, 4s, 8s and 16s after each
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff used for webhook jobs
    ///
    /// - 5 max attempts
    /// - 2 second initial interval
    /// - 10 minute max interval
    /// - 2x backoff coefficient
    /// - 20% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(600),
            backoff_coefficient: 2.0,
            jitter: 0.2,
        }
    }

    /// Constant delay, no jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next try after `failed_attempts` failures (1-based)
    pub fn delay_after_failures(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = (failed_attempts - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let floor = capped * (1.0 - self.jitter);
            rand::thread_rng().gen_range(floor..=capped)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Whether a job that has been tried `attempts_made` times goes back on the queue
    pub fn has_attempts_remaining(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
