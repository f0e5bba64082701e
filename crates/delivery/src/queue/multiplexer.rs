//! Per-shop queue multiplexer
//!
//! Lazily opens one work queue and one consumer handle per shop and caches
//! them for the life of the process. Queue handles are never evicted;
//! consumer handles idle longer than `stale_after` are closed and dropped by
//! [`QueueMultiplexer::evict_stale_consumers`], and recreated on next use.
//!
//! Also owns the active-shop set in shared state: shops are added on
//! admission and removed by workers once their queue is observed drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{ClaimedJob, JobCounts, QueueOptions};
use super::store::{JobQueue, QueueBackend, QueueError};
use crate::duration_millis;
use crate::reliability::RetryPolicy;
use crate::state::{keys, SharedState, StateError};

/// Deterministic queue name for a shop
pub fn queue_name(shop_id: Uuid) -> String {
    format!("shop-queue-{shop_id}")
}

/// Deterministic consumer id for a shop
pub fn consumer_id(shop_id: Uuid) -> String {
    format!("shop-worker-{shop_id}")
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultiplexerConfig {
    /// Lease length for claimed jobs
    #[serde(with = "duration_millis")]
    pub lock_duration: Duration,

    /// Consumers idle longer than this are evicted
    #[serde(with = "duration_millis")]
    pub stale_after: Duration,

    /// Retry policy applied to every shop queue
    pub retry: RetryPolicy,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            stale_after: Duration::from_secs(60 * 60),
            retry: RetryPolicy::exponential(),
        }
    }
}

impl MultiplexerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Error type for multiplexer operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum MultiplexerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Consumer handle for one shop's queue
pub struct ShopConsumer {
    id: String,
    shop_id: Uuid,
    queue: Arc<dyn JobQueue>,
    lock_duration: Duration,
    last_activity_at: RwLock<Option<DateTime<Utc>>>,
    closed: AtomicBool,
}

impl ShopConsumer {
    fn new(shop_id: Uuid, queue: Arc<dyn JobQueue>, lock_duration: Duration) -> Self {
        Self {
            id: consumer_id(shop_id),
            shop_id,
            queue,
            lock_duration,
            last_activity_at: RwLock::new(Some(Utc::now())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shop_id(&self) -> Uuid {
        self.shop_id
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        *self.last_activity_at.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Lease the next job for `token`; a closed consumer yields nothing
    pub async fn next_job(&self, token: &str) -> Result<Option<ClaimedJob>, QueueError> {
        if self.is_closed() {
            debug!(consumer = %self.id, "claim on closed consumer ignored");
            return Ok(None);
        }
        self.queue.claim_next(token, self.lock_duration).await
    }

    fn touch(&self, at: DateTime<Utc>) {
        *self.last_activity_at.write() = Some(at);
    }

    fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.last_activity_at() {
            None => true,
            Some(at) => now.signed_duration_since(at) > stale_after,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Process-wide registry of per-shop queues and consumers
///
/// Safe to share between the admission scheduler and any number of worker
/// tasks; every cache is a sharded concurrent map.
pub struct QueueMultiplexer {
    backend: Arc<dyn QueueBackend>,
    state: Arc<dyn SharedState>,
    config: MultiplexerConfig,
    queues: DashMap<Uuid, Arc<dyn JobQueue>>,
    consumers: DashMap<Uuid, Arc<ShopConsumer>>,
}

impl QueueMultiplexer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        state: Arc<dyn SharedState>,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            backend,
            state,
            config,
            queues: DashMap::new(),
            consumers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Queue for a shop, opened on first use
    pub fn queue(&self, shop_id: Uuid) -> Arc<dyn JobQueue> {
        self.queues
            .entry(shop_id)
            .or_insert_with(|| {
                let name = queue_name(shop_id);
                info!(shop_id = %shop_id, queue = %name, "opening shop queue");
                let options = QueueOptions::default().with_retry(self.config.retry.clone());
                self.backend.open(&name, &options)
            })
            .value()
            .clone()
    }

    /// Consumer for a shop, created on first use or after eviction
    pub fn consumer(&self, shop_id: Uuid) -> Arc<ShopConsumer> {
        if let Some(existing) = self.consumers.get(&shop_id) {
            return existing.value().clone();
        }
        let queue = self.queue(shop_id);
        self.consumers
            .entry(shop_id)
            .or_insert_with(|| {
                debug!(shop_id = %shop_id, "creating shop consumer");
                Arc::new(ShopConsumer::new(shop_id, queue, self.config.lock_duration))
            })
            .value()
            .clone()
    }

    /// Record consumer activity for a shop
    pub fn update_activity(&self, shop_id: Uuid, at: DateTime<Utc>) {
        match self.consumers.get(&shop_id) {
            Some(consumer) => consumer.touch(at),
            None => warn!(shop_id = %shop_id, "activity update for shop without consumer"),
        }
    }

    /// Close and drop consumers idle longer than `stale_after`
    ///
    /// Returns the shops whose consumers were evicted.
    pub fn evict_stale_consumers(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut evicted = Vec::new();
        self.consumers.retain(|shop_id, consumer| {
            if consumer.is_stale(now, stale_after) {
                consumer.close();
                evicted.push(*shop_id);
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale shop consumers");
        }
        evicted
    }

    /// Number of cached queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of cached consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Add a shop to the active-shop set
    pub async fn mark_active(&self, shop_id: Uuid) -> Result<(), StateError> {
        self.state
            .sadd(keys::ACTIVE_SHOPS, &shop_id.to_string())
            .await?;
        Ok(())
    }

    /// Remove a shop from the active-shop set
    pub async fn mark_inactive(&self, shop_id: Uuid) -> Result<(), StateError> {
        if self
            .state
            .srem(keys::ACTIVE_SHOPS, &shop_id.to_string())
            .await?
        {
            debug!(shop_id = %shop_id, "shop removed from active set");
        }
        Ok(())
    }

    /// Shops currently in the active-shop set, in a stable order
    pub async fn active_shops(&self) -> Result<Vec<Uuid>, StateError> {
        let members = self.state.smembers(keys::ACTIVE_SHOPS).await?;
        Ok(members
            .iter()
            .filter_map(|m| match m.parse::<Uuid>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(member = %m, "ignoring malformed active shop id");
                    None
                }
            })
            .collect())
    }

    /// Depth breakdown of one shop's queue
    pub async fn shop_counts(&self, shop_id: Uuid) -> Result<JobCounts, QueueError> {
        self.queue(shop_id).counts().await
    }

    /// Waiting + active + delayed jobs for one shop
    pub async fn shop_depth(&self, shop_id: Uuid) -> Result<u64, QueueError> {
        Ok(self.shop_counts(shop_id).await?.depth())
    }

    /// Sum of shop depths across the active-shop set
    pub async fn global_depth(&self) -> Result<u64, MultiplexerError> {
        let mut total = 0;
        for shop_id in self.active_shops().await? {
            total += self.shop_depth(shop_id).await?;
        }
        Ok(total)
    }
}
