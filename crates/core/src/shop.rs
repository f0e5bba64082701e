// Shop (tenant) domain type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Shop - the tenant unit of fairness and isolation.
/// Owns webhook registrations and events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Shop {
    /// Unique identifier for the shop.
    pub id: Uuid,
    /// Human-readable shop name.
    pub name: String,
    /// Timestamp when the shop was created.
    pub created_at: DateTime<Utc>,
}

impl Shop {
    /// Create a new shop with a time-ordered id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}
