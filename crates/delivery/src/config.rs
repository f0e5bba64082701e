//! Pipeline configuration
//!
//! Groups the per-component configs and reads overrides from the
//! environment. Unset variables keep their defaults; malformed values are
//! rejected rather than silently ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::MultiplexerConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::scheduler::{BackpressureConfig, SchedulerConfig};
use crate::worker::{DeliveryConfig, WorkerConfig};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything needed to assemble a [`crate::DeliveryPipeline`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub backpressure: BackpressureConfig,
    pub circuit: CircuitBreakerConfig,
    pub multiplexer: MultiplexerConfig,
    pub delivery: DeliveryConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `WORKER_ID` | worker.worker_id |
    /// | `WORKER_CONCURRENCY` | worker.concurrency |
    /// | `IDLE_WAIT_MS` | scheduler.idle_wait, worker.idle_wait |
    /// | `LOOP_ERROR_BOUNDARY` | scheduler/worker error_boundary |
    /// | `GLOBAL_BACKPRESSURE_TRIGGER` | backpressure.global_trigger (resolution = half) |
    /// | `TENANT_BACKPRESSURE_TRIGGER` | backpressure.tenant_trigger (resolution = half) |
    /// | `CIRCUIT_ERROR_LIMIT` | circuit.error_limit |
    /// | `CIRCUIT_COOLDOWN_MS` | circuit.cooldown |
    /// | `CIRCUIT_WINDOW_MS` | circuit.failure_window |
    /// | `MAX_RETRIES` | delivery.max_retries, multiplexer.retry.max_attempts |
    /// | `DELIVERY_TIMEOUT_MS` | delivery.request_timeout |
    /// | `LOCK_DURATION_MS` | multiplexer.lock_duration |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = lookup("WORKER_ID").filter(|s| !s.is_empty()) {
            config.worker.worker_id = id;
        }
        if let Some(n) = parse::<usize>(&lookup, "WORKER_CONCURRENCY")? {
            config.worker = config.worker.with_concurrency(n);
        }
        if let Some(ms) = parse::<u64>(&lookup, "IDLE_WAIT_MS")? {
            let wait = Duration::from_millis(ms);
            config.scheduler.idle_wait = wait;
            config.worker.idle_wait = wait;
        }
        if let Some(enabled) = parse_bool(&lookup, "LOOP_ERROR_BOUNDARY")? {
            config.scheduler.error_boundary = enabled;
            config.worker.error_boundary = enabled;
        }
        if let Some(trigger) = parse::<u64>(&lookup, "GLOBAL_BACKPRESSURE_TRIGGER")? {
            config.backpressure = config
                .backpressure
                .with_global_thresholds(trigger, trigger / 2);
        }
        if let Some(trigger) = parse::<u64>(&lookup, "TENANT_BACKPRESSURE_TRIGGER")? {
            config.backpressure = config
                .backpressure
                .with_tenant_thresholds(trigger, trigger / 2);
        }
        if let Some(limit) = parse::<u32>(&lookup, "CIRCUIT_ERROR_LIMIT")? {
            config.circuit = config.circuit.with_error_limit(limit);
        }
        if let Some(ms) = parse::<u64>(&lookup, "CIRCUIT_COOLDOWN_MS")? {
            config.circuit = config.circuit.with_cooldown(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, "CIRCUIT_WINDOW_MS")? {
            config.circuit = config
                .circuit
                .with_failure_window(Duration::from_millis(ms));
        }
        if let Some(retries) = parse::<u32>(&lookup, "MAX_RETRIES")? {
            config = config.with_max_retries(retries);
        }
        if let Some(ms) = parse::<u64>(&lookup, "DELIVERY_TIMEOUT_MS")? {
            config.delivery = config
                .delivery
                .with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, "LOCK_DURATION_MS")? {
            config.multiplexer = config
                .multiplexer
                .with_lock_duration(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Set delivery retries and queue attempts together
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.delivery = self.delivery.with_max_retries(retries);
        self.multiplexer.retry = self
            .multiplexer
            .retry
            .with_max_attempts(self.delivery.max_retries);
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.scheduler.idle_wait = idle_wait;
        self.worker.idle_wait = idle_wait;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backpressure
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.delivery.max_retries != self.multiplexer.retry.max_attempts {
            return Err(ConfigError::Invalid(format!(
                "delivery.max_retries ({}) must equal queue retry attempts ({})",
                self.delivery.max_retries, self.multiplexer.retry.max_attempts
            )));
        }
        if self.circuit.error_limit == 0 {
            return Err(ConfigError::Invalid(
                "circuit.error_limit must be at least 1".into(),
            ));
        }
        if self.multiplexer.lock_duration <= self.delivery.request_timeout {
            return Err(ConfigError::Invalid(
                "lock_duration must exceed the delivery request timeout".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { var, value }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidVar { var, value }),
        },
    }
}
