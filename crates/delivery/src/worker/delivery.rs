//! Delivery of one job to its webhook target
//!
//! ```text
//!  get_or_create attempt ──terminal──► AlreadySettled
//!          │
//!     circuit open? ──yes──► delay job until now + cooldown ──► Deferred
//!          │ no
//!        POST envelope
//!      ┌───┴────────────┐
//!     2xx          non-2xx / transport
//!      │                │
//!   success     failed, or dead at max_retries
//!                 + circuit failure
//! ```
//!
//! The attempt row and the queue job are separate writes. The store guards
//! terminal rows so a duplicate claim can never push `attempts` past the
//! settled value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{DeliveryAttempt, DeliveryStatus, Event, Registration};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::client::{truncate_body, WebhookClient};
use crate::duration_millis;
use crate::metrics::DeliveryMetrics;
use crate::persistence::{AttemptOutcome, DeliveryStore, StoreError};
use crate::queue::{ClaimedJob, JobQueue, QueueError};
use crate::reliability::CircuitBreaker;
use crate::state::StateError;

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Tries before an attempt row is marked dead
    pub max_retries: u32,

    /// Per-request timeout for the outbound POST
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl DeliveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Errors from a delivery try
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// No HTTP response (connect failure, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    /// Target answered with a non-2xx status
    #[error("target responded with HTTP {status}")]
    HttpStatus { status: u16, body: String },

    /// HTTP client could not be built
    #[error("client configuration error: {0}")]
    Client(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl DeliveryError {
    /// Whether the target itself failed, as opposed to our own infrastructure
    pub fn is_target_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HttpStatus { .. })
    }
}

/// Non-error results of a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Target accepted the webhook
    Delivered { attempt_id: Uuid, attempts: u32 },

    /// Circuit open; job delayed without touching the attempt row
    Deferred { until: DateTime<Utc> },

    /// Attempt row already terminal; nothing sent
    AlreadySettled {
        attempt_id: Uuid,
        status: DeliveryStatus,
    },
}

/// Executes deliveries and keeps attempt rows, circuits and metrics in step
pub struct WebhookDeliverer {
    store: Arc<dyn DeliveryStore>,
    circuit: CircuitBreaker,
    metrics: DeliveryMetrics,
    client: WebhookClient,
    config: DeliveryConfig,
}

impl WebhookDeliverer {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        circuit: CircuitBreaker,
        metrics: DeliveryMetrics,
        config: DeliveryConfig,
    ) -> Result<Self, DeliveryError> {
        let client = WebhookClient::new(config.request_timeout)
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self {
            store,
            circuit,
            metrics,
            client,
            config,
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Deliver `event` to `registration` for a job leased from `queue`
    #[instrument(
        skip(self, job, queue, event, registration),
        fields(job_id = %job.id, event_id = %event.id, registration_id = %registration.id)
    )]
    pub async fn deliver(
        &self,
        job: &ClaimedJob,
        queue: &dyn JobQueue,
        event: &Event,
        registration: &Registration,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let attempt = self
            .store
            .get_or_create_attempt(event.id, registration.id)
            .await?;
        if attempt.status.is_terminal() {
            debug!(status = %attempt.status, "attempt already settled");
            return Ok(DeliveryOutcome::AlreadySettled {
                attempt_id: attempt.id,
                status: attempt.status,
            });
        }

        if self.circuit.is_open(registration.id).await? {
            let until = Utc::now()
                + chrono::Duration::from_std(self.circuit.cooldown())
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            queue.delay_until(job.id, &job.token, until).await?;
            info!(until = %until, "circuit open, delivery deferred");
            return Ok(DeliveryOutcome::Deferred { until });
        }

        self.metrics.record_attempt().await?;

        let (outcome, failure) = match self.client.send(&registration.target_url, event).await {
            Ok(response) if response.is_success() => (
                AttemptOutcome {
                    succeeded: true,
                    response_code: Some(response.status),
                    response_body: Some(response.body),
                    attempted_at: Utc::now(),
                },
                None,
            ),
            Ok(response) => (
                AttemptOutcome {
                    succeeded: false,
                    response_code: Some(response.status),
                    response_body: Some(response.body.clone()),
                    attempted_at: Utc::now(),
                },
                Some(DeliveryError::HttpStatus {
                    status: response.status,
                    body: response.body,
                }),
            ),
            Err(e) => {
                let message = truncate_body(e.to_string());
                (
                    AttemptOutcome {
                        succeeded: false,
                        response_code: None,
                        response_body: Some(message.clone()),
                        attempted_at: Utc::now(),
                    },
                    Some(DeliveryError::Transport(message)),
                )
            }
        };

        let updated = self
            .store
            .record_attempt_outcome(attempt.id, outcome, self.config.max_retries)
            .await?;

        let Some(err) = failure else {
            return self
                .on_success(attempt.id, registration.id, updated, event)
                .await;
        };

        let record = self.circuit.record_failure(registration.id).await?;
        match updated {
            Some(row) if row.status == DeliveryStatus::Dead => {
                warn!(
                    attempts = row.attempts,
                    circuit_open = record.opened,
                    error = %err,
                    "delivery dead"
                );
                // Transport failures leave no dead-delivery trace in the metrics
                if matches!(err, DeliveryError::HttpStatus { .. }) {
                    self.metrics.record_dead().await?;
                    self.metrics.record_e2e_latency(since(event.created_at)).await?;
                }
            }
            Some(row) => {
                warn!(
                    attempts = row.attempts,
                    circuit_open = record.opened,
                    error = %err,
                    "delivery failed"
                );
            }
            None => warn!(error = %err, "delivery failed on an already settled attempt"),
        }
        Err(err)
    }

    async fn on_success(
        &self,
        attempt_id: Uuid,
        registration_id: Uuid,
        updated: Option<DeliveryAttempt>,
        event: &Event,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let Some(row) = updated else {
            warn!("delivered, but attempt was settled concurrently");
            let status = self
                .store
                .find_attempt(event.id, registration_id)
                .await?
                .map(|a| a.status)
                .unwrap_or(DeliveryStatus::Success);
            return Ok(DeliveryOutcome::AlreadySettled { attempt_id, status });
        };

        self.metrics.record_attempt_success().await?;
        self.metrics.record_delivery_success().await?;
        self.metrics.record_e2e_latency(since(event.created_at)).await?;
        debug!(attempts = row.attempts, "delivered");

        Ok(DeliveryOutcome::Delivered {
            attempt_id: row.id,
            attempts: row.attempts,
        })
    }
}

fn since(at: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(at)
        .to_std()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryDeliveryStore, NewEvent, NewRegistration};
    use crate::queue::{InMemoryJobQueue, QueueOptions, WebhookJob};
    use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    use crate::state::{InMemorySharedState, SharedState};
    use crate::worker::MAX_RESPONSE_BODY_BYTES;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOCK: Duration = Duration::from_secs(60);

    struct Fixture {
        store: Arc<InMemoryDeliveryStore>,
        metrics: DeliveryMetrics,
        deliverer: WebhookDeliverer,
        queue: InMemoryJobQueue,
    }

    /// Deliverer that marks attempts dead after the first failure
    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDeliveryStore::new());
        let state: Arc<dyn SharedState> = Arc::new(InMemorySharedState::new());
        let metrics = DeliveryMetrics::new(state.clone());
        let deliverer = WebhookDeliverer::new(
            store.clone(),
            CircuitBreaker::new(state, CircuitBreakerConfig::default()),
            metrics.clone(),
            DeliveryConfig::default()
                .with_max_retries(1)
                .with_request_timeout(Duration::from_secs(5)),
        )
        .unwrap();
        let queue = InMemoryJobQueue::new(
            "shop-queue-test",
            &QueueOptions::default().with_retry(RetryPolicy::fixed(Duration::ZERO, 1)),
        );
        Fixture {
            store,
            metrics,
            deliverer,
            queue,
        }
    }

    async fn deliver_once(
        f: &Fixture,
        url: String,
    ) -> (Result<DeliveryOutcome, DeliveryError>, DeliveryAttempt) {
        let shop = f.store.create_shop("acme").await.unwrap();
        let registration = f
            .store
            .create_registration(NewRegistration {
                shop_id: shop.id,
                target_url: url,
                event_types: vec!["order.created".into()],
                secret: "whsec_test".into(),
                active: true,
            })
            .await
            .unwrap();
        let event = f
            .store
            .insert_event(NewEvent {
                shop_id: shop.id,
                event_type: "order.created".into(),
                payload: json!({"order": 1}),
            })
            .await
            .unwrap();

        f.queue
            .add(WebhookJob {
                event_id: event.id,
                shop_id: shop.id,
                registration_id: registration.id,
            })
            .await
            .unwrap();
        let job = f.queue.claim_next("w1", LOCK).await.unwrap().unwrap();

        let result = f
            .deliverer
            .deliver(&job, &f.queue, &event, &registration)
            .await;
        let attempt = f
            .store
            .find_attempt(event.id, registration.id)
            .await
            .unwrap()
            .unwrap();
        (result, attempt)
    }

    /// URL of a loopback port nothing listens on
    async fn refused_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/webhook")
    }

    #[tokio::test]
    async fn test_dead_after_transport_failure_skips_dead_metrics() {
        let f = fixture();
        let (result, attempt) = deliver_once(&f, refused_url().await).await;

        assert!(matches!(result, Err(DeliveryError::Transport(_))));
        assert_eq!(attempt.status, DeliveryStatus::Dead);
        assert_eq!(attempt.response_code, None);

        let metrics = f.metrics.snapshot().await.unwrap();
        assert_eq!(metrics.attempts.total, 1);
        assert_eq!(metrics.deliveries.dead, 0);
        assert_eq!(metrics.latency.samples, 0);
    }

    #[tokio::test]
    async fn test_dead_after_error_status_records_dead_metrics() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let f = fixture();
        let (result, attempt) = deliver_once(&f, format!("{}/webhook", server.uri())).await;

        assert!(matches!(
            result,
            Err(DeliveryError::HttpStatus { status: 500, .. })
        ));
        assert_eq!(attempt.status, DeliveryStatus::Dead);
        assert_eq!(attempt.response_body.as_deref(), Some("boom"));

        let metrics = f.metrics.snapshot().await.unwrap();
        assert_eq!(metrics.deliveries.dead, 1);
        assert_eq!(metrics.latency.samples, 1);
    }

    #[tokio::test]
    async fn test_large_error_page_is_stored_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("x".repeat(100_000)))
            .mount(&server)
            .await;

        let f = fixture();
        let (_, attempt) = deliver_once(&f, format!("{}/webhook", server.uri())).await;

        assert_eq!(attempt.response_code, Some(502));
        assert_eq!(
            attempt.response_body.map(|b| b.len()),
            Some(MAX_RESPONSE_BODY_BYTES)
        );
    }
}
