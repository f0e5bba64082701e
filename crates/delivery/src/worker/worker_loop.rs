//! Delivery worker loop
//!
//! Each worker rotates over the active-shop set, claiming at most one job per
//! iteration from the selected shop's queue with its own token. Several
//! workers may run side by side; the queue lease keeps them off each other's
//! jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::delivery::{DeliveryError, DeliveryOutcome, WebhookDeliverer};
use crate::duration_millis;
use crate::persistence::{DeliveryStore, StoreError};
use crate::queue::{ClaimedJob, JobFailureOutcome, JobQueue, QueueError, QueueMultiplexer};
use crate::scheduler::idle_wait;
use crate::state::StateError;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Claim token; must be unique per running worker
    pub worker_id: String,

    /// Pause when no shop has claimable work
    #[serde(with = "duration_millis")]
    pub idle_wait: Duration,

    /// Run the stale consumer sweep every this many iterations
    pub sweep_every: u64,

    /// Log iteration errors and keep going instead of stopping the loop
    pub error_boundary: bool,

    /// Number of workers the pipeline spawns
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            idle_wait: Duration::from_secs(1),
            sweep_every: 100,
            error_boundary: false,
            concurrency: 1,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_sweep_every(mut self, iterations: u64) -> Self {
        self.sweep_every = iterations.max(1);
        self
    }

    pub fn with_error_boundary(mut self, enabled: bool) -> Self {
        self.error_boundary = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Why a claimed job was dropped without delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDrop {
    EventNotFound,
    RegistrationNotFound,
    /// Registration no longer lists the event's type
    SubscriptionMismatch,
}

/// Worker loop errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// What one worker iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerTick {
    /// Active-shop set is empty
    Idle,

    /// Nothing claimable in the selected shop; `drained` when it was removed
    /// from the active set
    NoJob { shop_id: Uuid, drained: bool },

    Delivered { shop_id: Uuid, job_id: Uuid },

    /// Attempt row was already terminal; job completed without a call
    AlreadySettled { shop_id: Uuid, job_id: Uuid },

    /// Circuit open; job left delayed
    Deferred {
        shop_id: Uuid,
        job_id: Uuid,
        until: DateTime<Utc>,
    },

    /// Delivery failed; queue retry applied
    Failed {
        shop_id: Uuid,
        job_id: Uuid,
        retry: JobFailureOutcome,
    },

    Dropped {
        shop_id: Uuid,
        job_id: Uuid,
        reason: JobDrop,
    },

    /// Lease expired before the job could be settled
    LeaseLost { shop_id: Uuid, job_id: Uuid },
}

/// A single delivery worker
pub struct DeliveryWorker {
    multiplexer: Arc<QueueMultiplexer>,
    store: Arc<dyn DeliveryStore>,
    deliverer: Arc<WebhookDeliverer>,
    config: WorkerConfig,
    iteration: u64,
    consecutive_misses: usize,
    last_shop_count: usize,
}

impl DeliveryWorker {
    pub fn new(
        multiplexer: Arc<QueueMultiplexer>,
        store: Arc<dyn DeliveryStore>,
        deliverer: Arc<WebhookDeliverer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            multiplexer,
            store,
            deliverer,
            config,
            iteration: 0,
            consecutive_misses: 0,
            last_shop_count: 0,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Run one iteration
    pub async fn tick(&mut self) -> Result<WorkerTick, WorkerError> {
        let shops = self.multiplexer.active_shops().await?;
        self.last_shop_count = shops.len();
        if shops.is_empty() {
            return Ok(WorkerTick::Idle);
        }

        let shop_id = shops[(self.iteration % shops.len() as u64) as usize];
        self.iteration = self.iteration.wrapping_add(1);
        if self.iteration % self.config.sweep_every.max(1) == 0 {
            self.multiplexer.evict_stale_consumers(Utc::now());
        }

        let consumer = self.multiplexer.consumer(shop_id);
        let Some(job) = consumer.next_job(&self.config.worker_id).await? else {
            self.consecutive_misses += 1;
            let mut drained = self.multiplexer.shop_counts(shop_id).await?.is_drained();
            if drained {
                self.multiplexer.mark_inactive(shop_id).await?;
                // Admission may have enqueued between the count and the removal
                if !self.multiplexer.shop_counts(shop_id).await?.is_drained() {
                    self.multiplexer.mark_active(shop_id).await?;
                    drained = false;
                }
            }
            return Ok(WorkerTick::NoJob { shop_id, drained });
        };

        self.consecutive_misses = 0;
        self.multiplexer.update_activity(shop_id, Utc::now());
        self.process(shop_id, job).await
    }

    #[instrument(skip(self, job), fields(worker_id = %self.config.worker_id, job_id = %job.id))]
    async fn process(&self, shop_id: Uuid, job: ClaimedJob) -> Result<WorkerTick, WorkerError> {
        let queue = self.multiplexer.queue(shop_id);

        let Some(event) = self.store.get_event(job.data.event_id).await? else {
            return self.drop_job(&*queue, shop_id, &job, JobDrop::EventNotFound).await;
        };
        let Some(registration) = self
            .store
            .get_registration(job.data.registration_id)
            .await?
        else {
            return self
                .drop_job(&*queue, shop_id, &job, JobDrop::RegistrationNotFound)
                .await;
        };
        if !registration.subscribes_to(&event.event_type) {
            return self
                .drop_job(&*queue, shop_id, &job, JobDrop::SubscriptionMismatch)
                .await;
        }

        let job_id = job.id;
        let result = self
            .deliverer
            .deliver(&job, &*queue, &event, &registration)
            .await;

        let settled = match result {
            Ok(DeliveryOutcome::Delivered { .. }) => queue
                .complete(job_id, &job.token)
                .await
                .map(|_| WorkerTick::Delivered { shop_id, job_id }),
            Ok(DeliveryOutcome::AlreadySettled { .. }) => queue
                .complete(job_id, &job.token)
                .await
                .map(|_| WorkerTick::AlreadySettled { shop_id, job_id }),
            Ok(DeliveryOutcome::Deferred { until }) => Ok(WorkerTick::Deferred {
                shop_id,
                job_id,
                until,
            }),
            Err(e) => self.fail_job(&*queue, shop_id, &job, &e).await,
        };

        match settled {
            Err(QueueError::LeaseMismatch { .. }) => {
                warn!("lease lost before job could be settled");
                Ok(WorkerTick::LeaseLost { shop_id, job_id })
            }
            other => other.map_err(WorkerError::from),
        }
    }

    async fn fail_job(
        &self,
        queue: &dyn JobQueue,
        shop_id: Uuid,
        job: &ClaimedJob,
        err: &DeliveryError,
    ) -> Result<WorkerTick, QueueError> {
        if !err.is_target_failure() {
            error!(error = %err, "delivery infrastructure error");
        }
        let retry = queue.fail(job.id, &job.token, &err.to_string()).await?;
        match retry {
            JobFailureOutcome::WillRetry { attempts_made, delay } => debug!(
                attempts_made,
                delay_ms = delay.as_millis() as u64,
                "job scheduled for retry"
            ),
            JobFailureOutcome::Exhausted { attempts_made } => {
                warn!(attempts_made, "job exhausted its retries")
            }
        }
        Ok(WorkerTick::Failed {
            shop_id,
            job_id: job.id,
            retry,
        })
    }

    async fn drop_job(
        &self,
        queue: &dyn JobQueue,
        shop_id: Uuid,
        job: &ClaimedJob,
        reason: JobDrop,
    ) -> Result<WorkerTick, WorkerError> {
        warn!(
            reason = ?reason,
            event_id = %job.data.event_id,
            registration_id = %job.data.registration_id,
            "dropping job"
        );
        match queue.complete(job.id, &job.token).await {
            Ok(()) => Ok(WorkerTick::Dropped {
                shop_id,
                job_id: job.id,
                reason,
            }),
            Err(QueueError::LeaseMismatch { .. }) => Ok(WorkerTick::LeaseLost {
                shop_id,
                job_id: job.id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the loop should pause after this tick
    ///
    /// A worker that has missed on every active shop in a row pauses too, so
    /// shops holding only delayed jobs do not cause a hot loop.
    fn should_pause(&self, tick: &WorkerTick) -> bool {
        match tick {
            WorkerTick::Idle => true,
            WorkerTick::NoJob { .. } => self.consecutive_misses >= self.last_shop_count,
            _ => false,
        }
    }

    /// Loop until `shutdown` flips to true
    ///
    /// Without the error boundary the first iteration error stops the worker
    /// and is returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(worker_id = %self.config.worker_id, "delivery worker started");

        while !*shutdown.borrow() {
            let pause = match self.tick().await {
                Ok(tick) => self.should_pause(&tick),
                Err(e) if self.config.error_boundary => {
                    error!(worker_id = %self.config.worker_id, error = %e, "worker iteration failed");
                    true
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "delivery worker stopped");
                    return Err(e);
                }
            };

            if pause {
                self.consecutive_misses = 0;
                if idle_wait(self.config.idle_wait, &mut shutdown).await {
                    break;
                }
            }
            tokio::task::yield_now().await;
        }

        info!(
            worker_id = %self.config.worker_id,
            iterations = self.iteration,
            "delivery worker stopped"
        );
        Ok(())
    }
}
