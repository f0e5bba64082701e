//! Admission of stored events into shop queues
//!
//! [`Admission::admit_event`] is the single entry point that turns a stored
//! event into delivery jobs. [`AdmissionScheduler`] drains the backlog of
//! unadmitted events, one event per iteration, rotating across shops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::Event;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::backpressure::{BackpressureController, BackpressureError};
use super::idle_wait;
use crate::duration_millis;
use crate::persistence::{DeliveryStore, StoreError};
use crate::queue::{QueueError, QueueMultiplexer, WebhookJob};
use crate::state::StateError;

/// Errors raised while admitting events
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("backpressure error: {0}")]
    Backpressure(#[from] BackpressureError),
}

/// Result of admitting one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    /// Event marked admitted; `jobs` deliveries enqueued
    Admitted { jobs: usize },

    /// Someone else admitted it first; nothing enqueued
    AlreadyAdmitted,
}

impl AdmissionResult {
    pub fn jobs(&self) -> usize {
        match self {
            Self::Admitted { jobs } => *jobs,
            Self::AlreadyAdmitted => 0,
        }
    }
}

/// Fans an event out to its shop's subscribed registrations
pub struct Admission {
    store: Arc<dyn DeliveryStore>,
    multiplexer: Arc<QueueMultiplexer>,
}

impl Admission {
    pub fn new(store: Arc<dyn DeliveryStore>, multiplexer: Arc<QueueMultiplexer>) -> Self {
        Self { store, multiplexer }
    }

    /// Admit an event at most once and enqueue one job per subscriber
    ///
    /// Marking and enqueueing are separate writes: a crash between them
    /// leaves an admitted event without jobs.
    #[instrument(skip(self, event), fields(event_id = %event.id, shop_id = %event.shop_id))]
    pub async fn admit_event(&self, event: &Event) -> Result<AdmissionResult, AdmissionError> {
        if !self.store.mark_event_admitted(event.id, Utc::now()).await? {
            debug!("event already admitted");
            return Ok(AdmissionResult::AlreadyAdmitted);
        }

        let registrations = self.store.list_registrations(event.shop_id).await?;
        let queue = self.multiplexer.queue(event.shop_id);

        let mut jobs = 0;
        for registration in registrations
            .iter()
            .filter(|r| r.accepts(&event.event_type))
        {
            queue
                .add(WebhookJob {
                    event_id: event.id,
                    shop_id: event.shop_id,
                    registration_id: registration.id,
                })
                .await?;
            jobs += 1;
        }

        if jobs > 0 {
            self.multiplexer.mark_active(event.shop_id).await?;
        }

        debug!(jobs, event_type = %event.event_type, "event admitted");
        Ok(AdmissionResult::Admitted { jobs })
    }
}

/// Cadence and error policy shared by the pipeline loops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Pause when there is nothing to do or admission is throttled
    #[serde(with = "duration_millis")]
    pub idle_wait: Duration,

    /// Log iteration errors and keep going instead of stopping the loop
    pub error_boundary: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(1),
            error_boundary: false,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_error_boundary(mut self, enabled: bool) -> Self {
        self.error_boundary = enabled;
        self
    }
}

/// What one admission iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionTick {
    /// Global backpressure is active
    GlobalBackpressure,

    /// No shop has unadmitted events
    Idle,

    /// Selected shop is over its own threshold and was skipped
    ShopBackpressure { shop_id: Uuid },

    /// Selected shop's backlog vanished before it could be read
    NoEvent { shop_id: Uuid },

    Admitted {
        shop_id: Uuid,
        event_id: Uuid,
        jobs: usize,
    },

    AlreadyAdmitted { shop_id: Uuid, event_id: Uuid },
}

impl AdmissionTick {
    /// Whether the loop should pause before the next iteration
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::GlobalBackpressure | Self::Idle)
    }
}

/// Drains unadmitted events into shop queues
///
/// Each iteration picks `shops[iteration % len]` from the list of shops with
/// a backlog, recomputed every time. Shops entering or leaving the list shift
/// the rotation, so fairness is approximate.
pub struct AdmissionScheduler {
    admission: Arc<Admission>,
    backpressure: Arc<BackpressureController>,
    store: Arc<dyn DeliveryStore>,
    config: SchedulerConfig,
    iteration: u64,
}

impl AdmissionScheduler {
    pub fn new(
        admission: Arc<Admission>,
        backpressure: Arc<BackpressureController>,
        store: Arc<dyn DeliveryStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            admission,
            backpressure,
            store,
            config,
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Run one iteration
    pub async fn tick(&mut self) -> Result<AdmissionTick, AdmissionError> {
        if self.backpressure.refresh_global().await? {
            debug!("admission paused by global backpressure");
            return Ok(AdmissionTick::GlobalBackpressure);
        }

        let shops = self.store.shops_with_unadmitted_events().await?;
        if shops.is_empty() {
            return Ok(AdmissionTick::Idle);
        }

        let shop_id = shops[(self.iteration % shops.len() as u64) as usize];
        self.iteration = self.iteration.wrapping_add(1);

        if self.backpressure.check_tenant(shop_id).await? {
            debug!(shop_id = %shop_id, "shop skipped by backpressure");
            return Ok(AdmissionTick::ShopBackpressure { shop_id });
        }

        let Some(event) = self.store.oldest_unadmitted_event(shop_id).await? else {
            return Ok(AdmissionTick::NoEvent { shop_id });
        };

        Ok(match self.admission.admit_event(&event).await? {
            AdmissionResult::Admitted { jobs } => AdmissionTick::Admitted {
                shop_id,
                event_id: event.id,
                jobs,
            },
            AdmissionResult::AlreadyAdmitted => AdmissionTick::AlreadyAdmitted {
                shop_id,
                event_id: event.id,
            },
        })
    }

    /// Loop until `shutdown` flips to true
    ///
    /// Without the error boundary the first iteration error stops the loop
    /// and is returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AdmissionError> {
        info!(
            idle_wait_ms = self.config.idle_wait.as_millis() as u64,
            error_boundary = self.config.error_boundary,
            "admission scheduler started"
        );

        while !*shutdown.borrow() {
            let pause = match self.tick().await {
                Ok(tick) => tick.is_idle(),
                Err(e) if self.config.error_boundary => {
                    error!(error = %e, "admission iteration failed");
                    true
                }
                Err(e) => {
                    error!(error = %e, "admission scheduler stopped");
                    return Err(e);
                }
            };

            if pause && idle_wait(self.config.idle_wait, &mut shutdown).await {
                break;
            }
            tokio::task::yield_now().await;
        }

        info!(iterations = self.iteration, "admission scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryDeliveryStore, NewEvent, NewRegistration};
    use crate::queue::{InMemoryQueueBackend, MultiplexerConfig};
    use crate::scheduler::BackpressureConfig;
    use crate::state::{InMemorySharedState, SharedState};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryDeliveryStore>,
        mux: Arc<QueueMultiplexer>,
        admission: Arc<Admission>,
        backpressure: Arc<BackpressureController>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDeliveryStore::new());
        let state: Arc<dyn SharedState> = Arc::new(InMemorySharedState::new());
        let mux = Arc::new(QueueMultiplexer::new(
            Arc::new(InMemoryQueueBackend::new()),
            state.clone(),
            MultiplexerConfig::default(),
        ));
        let admission = Arc::new(Admission::new(store.clone(), mux.clone()));
        let backpressure = Arc::new(BackpressureController::new(
            mux.clone(),
            state,
            BackpressureConfig::default(),
        ));
        Fixture {
            store,
            mux,
            admission,
            backpressure,
        }
    }

    impl Fixture {
        fn scheduler(&self) -> AdmissionScheduler {
            AdmissionScheduler::new(
                self.admission.clone(),
                self.backpressure.clone(),
                self.store.clone(),
                SchedulerConfig::default().with_idle_wait(Duration::from_millis(10)),
            )
        }

        async fn shop_with_registration(&self, event_types: &[&str], active: bool) -> Uuid {
            let shop = self.store.create_shop("shop").await.unwrap();
            self.register(shop.id, event_types, active).await;
            shop.id
        }

        async fn register(&self, shop_id: Uuid, event_types: &[&str], active: bool) {
            self.store
                .create_registration(NewRegistration {
                    shop_id,
                    target_url: "http://localhost/webhook".into(),
                    event_types: event_types.iter().map(|s| s.to_string()).collect(),
                    secret: "secret".into(),
                    active,
                })
                .await
                .unwrap();
        }

        async fn event(&self, shop_id: Uuid, event_type: &str) -> Event {
            self.store
                .insert_event(NewEvent {
                    shop_id,
                    event_type: event_type.into(),
                    payload: json!({"n": 1}),
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_admit_fans_out_to_active_subscribers_only() {
        let f = fixture();
        let shop = f.shop_with_registration(&["order.created"], true).await;
        f.register(shop, &["order.created", "order.paid"], true).await;
        f.register(shop, &["order.paid"], true).await;
        f.register(shop, &["order.created"], false).await;
        let event = f.event(shop, "order.created").await;

        let result = f.admission.admit_event(&event).await.unwrap();

        assert_eq!(result, AdmissionResult::Admitted { jobs: 2 });
        assert_eq!(f.mux.shop_depth(shop).await.unwrap(), 2);
        assert_eq!(f.mux.active_shops().await.unwrap(), vec![shop]);
        let stored = f.store.get_event(event.id).await.unwrap().unwrap();
        assert!(stored.queued_at.is_some());
    }

    #[tokio::test]
    async fn test_admit_is_at_most_once() {
        let f = fixture();
        let shop = f.shop_with_registration(&["order.created"], true).await;
        let event = f.event(shop, "order.created").await;

        f.admission.admit_event(&event).await.unwrap();
        let first = f.store.get_event(event.id).await.unwrap().unwrap().queued_at;
        let again = f.admission.admit_event(&event).await.unwrap();

        assert_eq!(again, AdmissionResult::AlreadyAdmitted);
        assert_eq!(again.jobs(), 0);
        assert_eq!(f.mux.shop_depth(shop).await.unwrap(), 1);
        let second = f.store.get_event(event.id).await.unwrap().unwrap().queued_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_admit_without_subscribers_leaves_shop_inactive() {
        let f = fixture();
        let shop = f.shop_with_registration(&["order.paid"], true).await;
        let event = f.event(shop, "order.created").await;

        let result = f.admission.admit_event(&event).await.unwrap();

        assert_eq!(result, AdmissionResult::Admitted { jobs: 0 });
        assert!(f.mux.active_shops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_idle_without_backlog() {
        let f = fixture();
        let mut scheduler = f.scheduler();
        assert_eq!(scheduler.tick().await.unwrap(), AdmissionTick::Idle);
        assert_eq!(scheduler.iteration(), 0);
    }

    #[tokio::test]
    async fn test_tick_admits_oldest_event_first() {
        let f = fixture();
        let shop = f.shop_with_registration(&["a"], true).await;
        let first = f.event(shop, "a").await;
        let second = f.event(shop, "a").await;
        let mut scheduler = f.scheduler();

        assert_eq!(
            scheduler.tick().await.unwrap(),
            AdmissionTick::Admitted {
                shop_id: shop,
                event_id: first.id,
                jobs: 1
            }
        );
        assert!(matches!(
            scheduler.tick().await.unwrap(),
            AdmissionTick::Admitted { event_id, .. } if event_id == second.id
        ));
    }

    #[tokio::test]
    async fn test_tick_skips_shop_over_threshold() {
        let f = fixture();
        let shop = f.shop_with_registration(&["a"], true).await;
        for _ in 0..21 {
            let event = f.event(shop, "a").await;
            f.admission.admit_event(&event).await.unwrap();
        }
        f.event(shop, "a").await;
        let mut scheduler = f.scheduler();

        assert_eq!(
            scheduler.tick().await.unwrap(),
            AdmissionTick::ShopBackpressure { shop_id: shop }
        );
        assert_eq!(f.store.unadmitted_event_count(Some(shop)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.scheduler().run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
