//! # Courier Delivery Pipeline
//!
//! Multi-tenant webhook admission and delivery.
//!
//! ## Features
//!
//! - **Fair admission**: round-robin drain of stored events across shops
//! - **Backpressure**: global and per-shop throttling with hysteresis
//! - **Per-shop queues**: leases, delays and exponential retry per shop
//! - **Circuit breakers**: per-registration failure isolation
//! - **Idempotent bookkeeping**: one attempt row per (event, registration),
//!   frozen once settled
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DeliveryStore                         │
//! │   (PostgreSQL: shops, registrations, events, attempts)       │
//! └─────────────────────────────────────────────────────────────┘
//!        │ unadmitted events                    ▲ attempt rows
//!        ▼                                      │
//! ┌──────────────────────┐   jobs   ┌─────────────────────────┐
//! │ AdmissionScheduler   │ ───────► │ QueueMultiplexer        │
//! │ (backpressure gated) │          │ shop-queue-{shop_id}    │
//! └──────────────────────┘          └─────────────────────────┘
//!                                               │ claim
//!                                               ▼
//!                                   ┌─────────────────────────┐
//!                                   │ DeliveryWorker × N      │
//!                                   │ circuit check, POST     │
//!                                   └─────────────────────────┘
//! ```
//!
//! Flags, circuit counters, the active-shop set and metrics live in
//! [`SharedState`].
//!
//! ## Example
//!
//! ```ignore
//! use courier_delivery::prelude::*;
//!
//! let store = Arc::new(InMemoryDeliveryStore::new());
//! let pipeline = DeliveryPipeline::in_memory(store, PipelineConfig::from_env()?)?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handles = pipeline.spawn(shutdown_rx);
//!
//! // ... later
//! shutdown_tx.send(true)?;
//! handles.join().await?;
//! ```

pub mod config;
mod duration_millis;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod reliability;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use config::{ConfigError, PipelineConfig};
pub use metrics::{AttemptCounts, DeliveryCounts, DeliveryMetrics, LatencyStats, MetricsSnapshot};
pub use persistence::{
    AttemptOutcome, DeliveryStore, InMemoryDeliveryStore, NewEvent, NewRegistration,
    PostgresDeliveryStore, StoreError,
};
pub use pipeline::{DeliveryPipeline, PipelineError, PipelineHandles, PipelineStats, ShopStats};
pub use queue::{QueueMultiplexer, WebhookJob};
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
pub use scheduler::{
    Admission, AdmissionError, AdmissionResult, AdmissionScheduler, BackpressureConfig,
    BackpressureController, BackpressureScope, SchedulerConfig,
};
pub use state::{InMemorySharedState, SharedState, StateError};
pub use worker::{
    DeliveryConfig, DeliveryError, DeliveryOutcome, DeliveryWorker, JobDrop, WorkerConfig,
    WorkerError,
};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::persistence::{
        DeliveryStore, InMemoryDeliveryStore, NewEvent, NewRegistration, PostgresDeliveryStore,
        StoreError,
    };
    pub use crate::pipeline::{DeliveryPipeline, PipelineError};
    pub use crate::scheduler::{AdmissionResult, BackpressureScope};
    pub use crate::state::SharedState;
    pub use std::sync::Arc;
}
