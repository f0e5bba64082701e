//! Per-shop work queues
//!
//! This module provides:
//! - [`JobQueue`] / [`QueueBackend`] traits for the job store
//! - [`InMemoryQueueBackend`] with leases, delays and exponential retry
//! - [`QueueMultiplexer`] caching one queue and one consumer per shop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      QueueMultiplexer                         │
//! │   queues:    shop_id ──► Arc<dyn JobQueue>   (process life)   │
//! │   consumers: shop_id ──► Arc<ShopConsumer>   (evicted idle)   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ open("shop-queue-{id}")
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        QueueBackend                           │
//! │   waiting ──claim──► active ──complete──► completed           │
//! │      ▲                 │ fail (attempts left) ──► delayed     │
//! │      └──── run_at ─────┘ fail (exhausted) ─────► failed       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod job;
mod memory;
pub mod multiplexer;
mod store;

pub use job::{
    ClaimedJob, JobCounts, JobFailureOutcome, JobState, QueueOptions, WebhookJob,
};
pub use memory::{InMemoryJobQueue, InMemoryQueueBackend};
pub use multiplexer::{MultiplexerConfig, MultiplexerError, QueueMultiplexer, ShopConsumer};
pub use store::{JobQueue, QueueBackend, QueueError};
