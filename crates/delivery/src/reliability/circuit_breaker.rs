//! Per-registration circuit breaker
//!
//! State lives in [`SharedState`] so every worker sees the same circuit:
//!
//! ```text
//! ┌─────────┐   error_limit failures   ┌─────────┐   cooldown expires   ┌─────────┐
//! │ Closed  │ ───────────────────────► │  Open   │ ───────────────────► │ Closed  │
//! └─────────┘   inside failure window  └─────────┘   (flag key TTL)     └─────────┘
//! ```
//!
//! There is no half-open probe limit: once the open flag expires every
//! queued job for the registration is attempted again. Successful
//! deliveries do not reset the failure counter; only the window expiry does.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::duration_millis;
use crate::state::{keys, SharedState, StateError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries allowed
    Closed,

    /// Deliveries deferred until the cooldown expires
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use courier_delivery::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_error_limit(5)
///     .with_cooldown(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub error_limit: u32,

    /// Lifetime of the failure counter, started by the first failure
    #[serde(with = "duration_millis")]
    pub failure_window: Duration,

    /// How long the circuit stays open
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_limit: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of failures that opens the circuit
    pub fn with_error_limit(mut self, limit: u32) -> Self {
        self.error_limit = limit.max(1);
        self
    }

    /// Set the failure counting window
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Set how long an open circuit stays open
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Result of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Failures counted in the current window, including this one
    pub failures: i64,
    /// Whether this failure reached the limit and (re)opened the circuit
    pub opened: bool,
}

/// Circuit breaker keyed by registration id
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new(state, CircuitBreakerConfig::default());
///
/// if breaker.is_open(registration.id).await? {
///     // defer the job until breaker.cooldown() has passed
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<dyn SharedState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(state: Arc<dyn SharedState>, config: CircuitBreakerConfig) -> Self {
        Self { state, config }
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// How long deferred jobs wait while the circuit is open
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// Whether deliveries to this registration are currently deferred
    pub async fn is_open(&self, registration_id: Uuid) -> Result<bool, StateError> {
        self.state.exists(&keys::circuit_open(registration_id)).await
    }

    /// Current state of the circuit
    pub async fn state(&self, registration_id: Uuid) -> Result<CircuitState, StateError> {
        Ok(if self.is_open(registration_id).await? {
            CircuitState::Open
        } else {
            CircuitState::Closed
        })
    }

    /// Failures counted in the current window
    pub async fn failure_count(&self, registration_id: Uuid) -> Result<i64, StateError> {
        let raw = self
            .state
            .get(&keys::circuit_failures(registration_id))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Record a failed delivery, opening the circuit at the error limit
    pub async fn record_failure(&self, registration_id: Uuid) -> Result<FailureRecord, StateError> {
        let failures = self
            .state
            .incr_with_window(
                &keys::circuit_failures(registration_id),
                self.config.failure_window,
            )
            .await?;

        let opened = failures >= i64::from(self.config.error_limit);
        if opened {
            self.state
                .set(
                    &keys::circuit_open(registration_id),
                    "1",
                    Some(self.config.cooldown),
                )
                .await?;
            warn!(
                registration_id = %registration_id,
                failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
        } else {
            debug!(registration_id = %registration_id, failures, "delivery failure recorded");
        }

        Ok(FailureRecord { failures, opened })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemorySharedState;

    fn create_test_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(InMemorySharedState::new()),
            CircuitBreakerConfig::default()
                .with_error_limit(3)
                .with_failure_window(Duration::from_secs(60))
                .with_cooldown(Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.error_limit, 5);
        assert_eq!(config.failure_window, Duration::from_secs(60));
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = create_test_breaker();
        let reg = Uuid::now_v7();
        assert_eq!(breaker.state(reg).await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(reg).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_opens_at_error_limit() {
        let breaker = create_test_breaker();
        let reg = Uuid::now_v7();

        for expected in 1..3 {
            let record = breaker.record_failure(reg).await.unwrap();
            assert_eq!(record.failures, expected);
            assert!(!record.opened);
            assert!(!breaker.is_open(reg).await.unwrap());
        }

        let record = breaker.record_failure(reg).await.unwrap();
        assert!(record.opened);
        assert_eq!(breaker.state(reg).await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_closes_after_cooldown() {
        let breaker = create_test_breaker();
        let reg = Uuid::now_v7();

        for _ in 0..3 {
            breaker.record_failure(reg).await.unwrap();
        }
        assert!(breaker.is_open(reg).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!breaker.is_open(reg).await.unwrap());
    }

    #[tokio::test]
    async fn test_circuits_are_isolated_per_registration() {
        let breaker = create_test_breaker();
        let failing = Uuid::now_v7();
        let healthy = Uuid::now_v7();

        for _ in 0..3 {
            breaker.record_failure(failing).await.unwrap();
        }

        assert!(breaker.is_open(failing).await.unwrap());
        assert!(!breaker.is_open(healthy).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_counter_resets_when_window_expires() {
        let breaker = CircuitBreaker::new(
            Arc::new(InMemorySharedState::new()),
            CircuitBreakerConfig::default()
                .with_error_limit(3)
                .with_failure_window(Duration::from_millis(80)),
        );
        let reg = Uuid::now_v7();

        breaker.record_failure(reg).await.unwrap();
        breaker.record_failure(reg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let record = breaker.record_failure(reg).await.unwrap();
        assert_eq!(record.failures, 1);
        assert!(!record.opened);
    }

    #[tokio::test]
    async fn test_failure_at_limit_after_reopen_reopens() {
        let breaker = create_test_breaker();
        let reg = Uuid::now_v7();

        for _ in 0..3 {
            breaker.record_failure(reg).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!breaker.is_open(reg).await.unwrap());

        // Counter still inside its 60s window, so one more failure reopens
        let record = breaker.record_failure(reg).await.unwrap();
        assert_eq!(record.failures, 4);
        assert!(record.opened);
    }
}
