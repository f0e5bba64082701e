//! Delivery metrics kept in shared state
//!
//! Counters for attempts and settled deliveries plus a capped list of recent
//! end-to-end latencies (event creation to settlement).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::{keys, SharedState, StateError};

/// Number of latency samples retained
pub const LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AttemptCounts {
    pub total: u64,
    pub success: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeliveryCounts {
    pub success: u64,
    pub dead: u64,
}

/// Aggregates over the retained latency samples, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LatencyStats {
    pub samples: usize,
    pub average_ms: f64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct MetricsSnapshot {
    pub attempts: AttemptCounts,
    pub deliveries: DeliveryCounts,
    pub latency: LatencyStats,
}

/// Handle over the metric keys
#[derive(Clone)]
pub struct DeliveryMetrics {
    state: Arc<dyn SharedState>,
}

impl DeliveryMetrics {
    pub fn new(state: Arc<dyn SharedState>) -> Self {
        Self { state }
    }

    /// An outbound call is about to be made
    pub async fn record_attempt(&self) -> Result<(), StateError> {
        self.state.incr(keys::METRICS_ATTEMPTS_TOTAL).await.map(|_| ())
    }

    pub async fn record_attempt_success(&self) -> Result<(), StateError> {
        self.state
            .incr(keys::METRICS_ATTEMPTS_SUCCESS)
            .await
            .map(|_| ())
    }

    pub async fn record_delivery_success(&self) -> Result<(), StateError> {
        self.state
            .incr(keys::METRICS_DELIVERIES_SUCCESS)
            .await
            .map(|_| ())
    }

    /// A delivery ran out of attempts
    pub async fn record_dead(&self) -> Result<(), StateError> {
        self.state
            .incr(keys::METRICS_DELIVERIES_DEAD)
            .await
            .map(|_| ())
    }

    pub async fn record_e2e_latency(&self, latency: Duration) -> Result<(), StateError> {
        self.state
            .lpush_capped(
                keys::METRICS_LATENCY_E2E,
                &(latency.as_millis() as u64).to_string(),
                LATENCY_SAMPLES,
            )
            .await
    }

    pub async fn attempt_counts(&self) -> Result<AttemptCounts, StateError> {
        Ok(AttemptCounts {
            total: self.counter(keys::METRICS_ATTEMPTS_TOTAL).await?,
            success: self.counter(keys::METRICS_ATTEMPTS_SUCCESS).await?,
        })
    }

    pub async fn delivery_counts(&self) -> Result<DeliveryCounts, StateError> {
        Ok(DeliveryCounts {
            success: self.counter(keys::METRICS_DELIVERIES_SUCCESS).await?,
            dead: self.counter(keys::METRICS_DELIVERIES_DEAD).await?,
        })
    }

    /// Average and max over the retained samples; zero when empty
    pub async fn latency_stats(&self) -> Result<LatencyStats, StateError> {
        let samples: Vec<u64> = self
            .state
            .lrange(keys::METRICS_LATENCY_E2E)
            .await?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        if samples.is_empty() {
            return Ok(LatencyStats::default());
        }

        let sum: u64 = samples.iter().sum();
        Ok(LatencyStats {
            samples: samples.len(),
            average_ms: sum as f64 / samples.len() as f64,
            max_ms: samples.iter().copied().max().unwrap_or(0),
        })
    }

    pub async fn snapshot(&self) -> Result<MetricsSnapshot, StateError> {
        Ok(MetricsSnapshot {
            attempts: self.attempt_counts().await?,
            deliveries: self.delivery_counts().await?,
            latency: self.latency_stats().await?,
        })
    }

    /// Reset every counter and drop the latency samples
    pub async fn clear(&self) -> Result<(), StateError> {
        for key in [
            keys::METRICS_ATTEMPTS_TOTAL,
            keys::METRICS_ATTEMPTS_SUCCESS,
            keys::METRICS_DELIVERIES_SUCCESS,
            keys::METRICS_DELIVERIES_DEAD,
            keys::METRICS_LATENCY_E2E,
        ] {
            self.state.del(key).await?;
        }
        Ok(())
    }

    async fn counter(&self, key: &str) -> Result<u64, StateError> {
        let Some(raw) = self.state.get(key).await? else {
            return Ok(0);
        };
        match raw.parse::<u64>() {
            Ok(v) => Ok(v),
            Err(_) => {
                warn!(key, value = %raw, "non-numeric metric counter");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemorySharedState;

    fn metrics() -> DeliveryMetrics {
        DeliveryMetrics::new(Arc::new(InMemorySharedState::new()))
    }

    #[tokio::test]
    async fn test_counters_start_at_zero() {
        let m = metrics();
        assert_eq!(m.snapshot().await.unwrap(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let m = metrics();
        m.record_attempt().await.unwrap();
        m.record_attempt().await.unwrap();
        m.record_attempt_success().await.unwrap();
        m.record_delivery_success().await.unwrap();
        m.record_dead().await.unwrap();

        assert_eq!(
            m.attempt_counts().await.unwrap(),
            AttemptCounts {
                total: 2,
                success: 1
            }
        );
        assert_eq!(
            m.delivery_counts().await.unwrap(),
            DeliveryCounts {
                success: 1,
                dead: 1
            }
        );
    }

    #[tokio::test]
    async fn test_latency_stats() {
        let m = metrics();
        for ms in [100, 300, 200] {
            m.record_e2e_latency(Duration::from_millis(ms)).await.unwrap();
        }

        let stats = m.latency_stats().await.unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.max_ms, 300);
        assert!((stats.average_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_latency_samples_are_capped() {
        let m = metrics();
        for ms in 0..(LATENCY_SAMPLES as u64 + 20) {
            m.record_e2e_latency(Duration::from_millis(ms)).await.unwrap();
        }

        let stats = m.latency_stats().await.unwrap();
        assert_eq!(stats.samples, LATENCY_SAMPLES);
        assert_eq!(stats.max_ms, LATENCY_SAMPLES as u64 + 19);
    }

    #[tokio::test]
    async fn test_clear() {
        let m = metrics();
        m.record_attempt().await.unwrap();
        m.record_e2e_latency(Duration::from_millis(5)).await.unwrap();

        m.clear().await.unwrap();

        assert_eq!(m.snapshot().await.unwrap(), MetricsSnapshot::default());
    }
}
