//! Backpressure control for admission
//!
//! Two levels, each with hysteresis between a trigger and a resolution depth:
//!
//! ```text
//!            depth >= trigger
//!   ┌──────────┐ ─────────────► ┌──────────┐
//!   │ INACTIVE │                │  ACTIVE  │
//!   └──────────┘ ◄───────────── └──────────┘
//!           depth < resolution
//! ```
//!
//! The global level sums depths across the active-shop set and caches its
//! verdict for `global_staleness`. The per-shop level is recomputed on every
//! check. Flags are persisted in shared state so dashboards and other
//! processes see the same verdict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::duration_millis;
use crate::queue::{MultiplexerError, QueueError, QueueMultiplexer};
use crate::state::{keys, SharedState, StateError};

const FLAG_ON: &str = "1";

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use courier_delivery::scheduler::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_global_thresholds(100, 40)
///     .with_tenant_thresholds(30, 15);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Global depth at which admission pauses
    pub global_trigger: u64,

    /// Global depth below which admission resumes
    pub global_resolution: u64,

    /// How long a cached global verdict stays valid
    #[serde(with = "duration_millis")]
    pub global_staleness: Duration,

    /// Per-shop depth at which that shop is skipped
    pub tenant_trigger: u64,

    /// Per-shop depth below which that shop is admitted again
    pub tenant_resolution: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            global_trigger: 50,
            global_resolution: 25,
            global_staleness: Duration::from_secs(30),
            tenant_trigger: 20,
            tenant_resolution: 10,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_thresholds(mut self, trigger: u64, resolution: u64) -> Self {
        self.global_trigger = trigger;
        self.global_resolution = resolution;
        self
    }

    pub fn with_tenant_thresholds(mut self, trigger: u64, resolution: u64) -> Self {
        self.tenant_trigger = trigger;
        self.tenant_resolution = resolution;
        self
    }

    pub fn with_global_staleness(mut self, staleness: Duration) -> Self {
        self.global_staleness = staleness;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.global_resolution >= self.global_trigger {
            return Err(BackpressureError::InvalidConfig(
                "global_resolution must be less than global_trigger".into(),
            ));
        }
        if self.tenant_resolution >= self.tenant_trigger {
            return Err(BackpressureError::InvalidConfig(
                "tenant_resolution must be less than tenant_trigger".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<MultiplexerError> for BackpressureError {
    fn from(err: MultiplexerError) -> Self {
        match err {
            MultiplexerError::Queue(e) => Self::Queue(e),
            MultiplexerError::State(e) => Self::State(e),
        }
    }
}

/// Which level of backpressure to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureScope {
    Global,
    Tenant(Uuid),
}

/// Hysteresis: once active, stay active until depth drops below resolution
fn next_flag(active: bool, depth: u64, trigger: u64, resolution: u64) -> bool {
    if active {
        depth >= resolution
    } else {
        depth >= trigger
    }
}

/// Evaluates and persists backpressure flags
pub struct BackpressureController {
    multiplexer: Arc<QueueMultiplexer>,
    state: Arc<dyn SharedState>,
    config: BackpressureConfig,
}

impl BackpressureController {
    pub fn new(
        multiplexer: Arc<QueueMultiplexer>,
        state: Arc<dyn SharedState>,
        config: BackpressureConfig,
    ) -> Self {
        Self {
            multiplexer,
            state,
            config,
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Evaluate a scope; global uses the cached path
    pub async fn is_active(&self, scope: BackpressureScope) -> Result<bool, BackpressureError> {
        match scope {
            BackpressureScope::Global => self.check_global().await,
            BackpressureScope::Tenant(shop_id) => self.check_tenant(shop_id).await,
        }
    }

    /// Recompute the global flag from current depths
    pub async fn refresh_global(&self) -> Result<bool, BackpressureError> {
        let depth = self.multiplexer.global_depth().await?;
        let was_active = self.global_flag().await?;
        let active = next_flag(
            was_active,
            depth,
            self.config.global_trigger,
            self.config.global_resolution,
        );

        if active != was_active {
            self.persist_flag(keys::GLOBAL_BACKPRESSURE, active).await?;
            if active {
                warn!(depth, trigger = self.config.global_trigger, "global backpressure activated");
            } else {
                info!(depth, resolution = self.config.global_resolution, "global backpressure resolved");
            }
        }

        self.state
            .set(
                keys::GLOBAL_BACKPRESSURE_CHECKED_AT,
                &Utc::now().to_rfc3339(),
                None,
            )
            .await?;
        debug!(depth, active, "global backpressure checked");
        Ok(active)
    }

    /// Global flag, recomputed only when the cached verdict is stale
    pub async fn check_global(&self) -> Result<bool, BackpressureError> {
        let staleness = chrono::Duration::from_std(self.config.global_staleness)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        match self.last_global_check().await? {
            Some(at) if Utc::now().signed_duration_since(at) < staleness => {
                Ok(self.global_flag().await?)
            }
            _ => self.refresh_global().await,
        }
    }

    /// Per-shop flag, recomputed on every call
    pub async fn check_tenant(&self, shop_id: Uuid) -> Result<bool, BackpressureError> {
        let depth = self.multiplexer.shop_depth(shop_id).await?;
        let was_active = self.tenant_flag(shop_id).await?;
        let active = next_flag(
            was_active,
            depth,
            self.config.tenant_trigger,
            self.config.tenant_resolution,
        );

        if active != was_active {
            self.persist_flag(&keys::shop_backpressure(shop_id), active)
                .await?;
            if active {
                warn!(shop_id = %shop_id, depth, "shop backpressure activated");
            } else {
                info!(shop_id = %shop_id, depth, "shop backpressure resolved");
            }
        }
        Ok(active)
    }

    /// Persisted global flag, without recomputing
    pub async fn global_flag(&self) -> Result<bool, StateError> {
        self.read_flag(keys::GLOBAL_BACKPRESSURE).await
    }

    /// Persisted per-shop flag, without recomputing
    pub async fn tenant_flag(&self, shop_id: Uuid) -> Result<bool, StateError> {
        self.read_flag(&keys::shop_backpressure(shop_id)).await
    }

    /// When the global flag was last recomputed
    pub async fn last_global_check(&self) -> Result<Option<DateTime<Utc>>, StateError> {
        let Some(raw) = self.state.get(keys::GLOBAL_BACKPRESSURE_CHECKED_AT).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!(value = %raw, error = %e, "unreadable backpressure timestamp");
                Ok(None)
            }
        }
    }

    async fn read_flag(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.state.get(key).await?.as_deref() == Some(FLAG_ON))
    }

    async fn persist_flag(&self, key: &str, active: bool) -> Result<(), StateError> {
        if active {
            self.state.set(key, FLAG_ON, None).await
        } else {
            self.state.del(key).await.map(|_| ())
        }
    }
}
