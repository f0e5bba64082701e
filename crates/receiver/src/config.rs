// Receiver configuration

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiverConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },
}

/// Simulation knobs for the receiver
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Delay before every response
    pub latency: Duration,
    /// Probability in [0, 1] that a delivery is answered with `failure_status`
    pub failure_rate: f64,
    pub failure_status: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            latency: Duration::ZERO,
            failure_rate: 0.0,
            failure_status: 500,
        }
    }
}

impl ReceiverConfig {
    /// Environment variables:
    /// - `RECEIVER_BIND_ADDR` (default `0.0.0.0:3001`)
    /// - `RECEIVER_LATENCY_MS` (default 0)
    /// - `RECEIVER_FAILURE_RATE` (default 0.0)
    /// - `RECEIVER_FAILURE_STATUS` (default 500)
    pub fn from_env() -> Result<Self, ReceiverConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ReceiverConfigError> {
        let mut config = Self::default();

        if let Some(addr) = parse(&lookup, "RECEIVER_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(ms) = parse::<u64>(&lookup, "RECEIVER_LATENCY_MS")? {
            config.latency = Duration::from_millis(ms);
        }
        if let Some(rate) = parse::<f64>(&lookup, "RECEIVER_FAILURE_RATE")? {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ReceiverConfigError::InvalidVar {
                    var: "RECEIVER_FAILURE_RATE",
                    value: rate.to_string(),
                });
            }
            config.failure_rate = rate;
        }
        if let Some(status) = parse::<u16>(&lookup, "RECEIVER_FAILURE_STATUS")? {
            if !(400..=599).contains(&status) {
                return Err(ReceiverConfigError::InvalidVar {
                    var: "RECEIVER_FAILURE_STATUS",
                    value: status.to_string(),
                });
            }
            config.failure_status = status;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ReceiverConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ReceiverConfigError::InvalidVar { var, value }),
    }
}
