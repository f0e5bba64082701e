//! Assembled delivery pipeline
//!
//! [`DeliveryPipeline`] wires the store, shared state and queue backend into
//! the admission scheduler and delivery workers, and exposes the read-only
//! getters dashboards and the HTTP API use.

use std::sync::Arc;

use courier_core::Event;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigError, PipelineConfig};
use crate::metrics::{
    AttemptCounts, DeliveryCounts, DeliveryMetrics, LatencyStats, MetricsSnapshot,
};
use crate::persistence::DeliveryStore;
use crate::queue::{InMemoryQueueBackend, MultiplexerError, QueueBackend, QueueError, QueueMultiplexer};
use crate::reliability::CircuitBreaker;
use crate::scheduler::{
    Admission, AdmissionError, AdmissionResult, AdmissionScheduler, BackpressureController,
};
use crate::state::{InMemorySharedState, SharedState, StateError};
use crate::worker::{DeliveryError, DeliveryWorker, WebhookDeliverer, WorkerError};

/// Pipeline assembly and runtime errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("admission scheduler failed: {0}")]
    Admission(#[from] AdmissionError),

    #[error("delivery worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("pipeline task panicked or was cancelled: {0}")]
    Join(String),
}

/// Depth and backpressure of one shop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ShopStats {
    pub shop_id: Uuid,
    pub depth: u64,
    pub backpressure: bool,
}

/// Dashboard snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PipelineStats {
    pub global_depth: u64,
    pub global_backpressure: bool,
    pub shops: Vec<ShopStats>,
    pub metrics: MetricsSnapshot,
}

/// Spawned pipeline loops
pub struct PipelineHandles {
    tasks: JoinSet<Result<(), PipelineError>>,
}

impl PipelineHandles {
    /// Number of loops still tracked
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every loop to stop
    ///
    /// Returns as soon as any loop fails; the remaining loops are aborted
    /// when the handles are dropped.
    pub async fn join(mut self) -> Result<(), PipelineError> {
        while let Some(finished) = self.tasks.join_next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(PipelineError::Join(e.to_string())),
            }
        }
        Ok(())
    }
}

/// The admission and delivery pipeline
pub struct DeliveryPipeline {
    store: Arc<dyn DeliveryStore>,
    state: Arc<dyn SharedState>,
    multiplexer: Arc<QueueMultiplexer>,
    backpressure: Arc<BackpressureController>,
    admission: Arc<Admission>,
    deliverer: Arc<WebhookDeliverer>,
    metrics: DeliveryMetrics,
    config: PipelineConfig,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        state: Arc<dyn SharedState>,
        backend: Arc<dyn QueueBackend>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let multiplexer = Arc::new(QueueMultiplexer::new(
            backend,
            state.clone(),
            config.multiplexer.clone(),
        ));
        let backpressure = Arc::new(BackpressureController::new(
            multiplexer.clone(),
            state.clone(),
            config.backpressure.clone(),
        ));
        let admission = Arc::new(Admission::new(store.clone(), multiplexer.clone()));
        let metrics = DeliveryMetrics::new(state.clone());
        let deliverer = Arc::new(WebhookDeliverer::new(
            store.clone(),
            CircuitBreaker::new(state.clone(), config.circuit.clone()),
            metrics.clone(),
            config.delivery.clone(),
        )?);

        Ok(Self {
            store,
            state,
            multiplexer,
            backpressure,
            admission,
            deliverer,
            metrics,
            config,
        })
    }

    /// Pipeline with process-local shared state and queues
    pub fn in_memory(
        store: Arc<dyn DeliveryStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        Self::new(
            store,
            Arc::new(InMemorySharedState::new()),
            Arc::new(InMemoryQueueBackend::new()),
            config,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    pub fn state(&self) -> &Arc<dyn SharedState> {
        &self.state
    }

    pub fn multiplexer(&self) -> &Arc<QueueMultiplexer> {
        &self.multiplexer
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        self.deliverer.circuit()
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Admit one stored event now, bypassing the drain
    pub async fn admit_event(&self, event: &Event) -> Result<AdmissionResult, AdmissionError> {
        self.admission.admit_event(event).await
    }

    pub fn admission_scheduler(&self) -> AdmissionScheduler {
        AdmissionScheduler::new(
            self.admission.clone(),
            self.backpressure.clone(),
            self.store.clone(),
            self.config.scheduler.clone(),
        )
    }

    /// Worker number `index`; ids are suffixed when more than one runs
    pub fn worker(&self, index: usize) -> DeliveryWorker {
        let mut config = self.config.worker.clone();
        if config.concurrency > 1 {
            config.worker_id = format!("{}-{}", config.worker_id, index);
        }
        DeliveryWorker::new(
            self.multiplexer.clone(),
            self.store.clone(),
            self.deliverer.clone(),
            config,
        )
    }

    /// Spawn the admission scheduler and `worker.concurrency` workers
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> PipelineHandles {
        let concurrency = self.config.worker.concurrency.max(1);
        info!(concurrency, "starting delivery pipeline");

        let mut tasks = JoinSet::new();
        let scheduler = self.admission_scheduler();
        let scheduler_shutdown = shutdown.clone();
        tasks.spawn(async move {
            scheduler
                .run(scheduler_shutdown)
                .await
                .map_err(PipelineError::from)
        });
        for i in 0..concurrency {
            let worker = self.worker(i);
            let worker_shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(worker_shutdown).await.map_err(PipelineError::from) });
        }

        PipelineHandles { tasks }
    }

    pub async fn global_depth(&self) -> Result<u64, MultiplexerError> {
        self.multiplexer.global_depth().await
    }

    pub async fn shop_depth(&self, shop_id: Uuid) -> Result<u64, QueueError> {
        self.multiplexer.shop_depth(shop_id).await
    }

    pub async fn global_backpressure(&self) -> Result<bool, StateError> {
        self.backpressure.global_flag().await
    }

    pub async fn shop_backpressure(&self, shop_id: Uuid) -> Result<bool, StateError> {
        self.backpressure.tenant_flag(shop_id).await
    }

    pub async fn attempt_counts(&self) -> Result<AttemptCounts, StateError> {
        self.metrics.attempt_counts().await
    }

    pub async fn delivery_counts(&self) -> Result<DeliveryCounts, StateError> {
        self.metrics.delivery_counts().await
    }

    pub async fn latency_stats(&self) -> Result<LatencyStats, StateError> {
        self.metrics.latency_stats().await
    }

    /// Snapshot across the active-shop set
    pub async fn stats(&self) -> Result<PipelineStats, MultiplexerError> {
        let shop_ids = self.multiplexer.active_shops().await?;
        let shops = try_join_all(shop_ids.into_iter().map(|shop_id| async move {
            Ok::<_, MultiplexerError>(ShopStats {
                shop_id,
                depth: self.multiplexer.shop_depth(shop_id).await?,
                backpressure: self.backpressure.tenant_flag(shop_id).await?,
            })
        }))
        .await?;

        Ok(PipelineStats {
            global_depth: shops.iter().map(|s| s.depth).sum(),
            global_backpressure: self.backpressure.global_flag().await?,
            shops,
            metrics: self.metrics.snapshot().await?,
        })
    }
}
