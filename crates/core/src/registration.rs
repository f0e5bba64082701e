// Webhook registration domain type
//
// A registration subscribes a target URL to a set of event types for one shop.
// Registrations are immutable after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Webhook registration for a shop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Registration {
    /// Unique identifier for the registration.
    pub id: Uuid,
    /// ID of the shop that owns this registration.
    pub shop_id: Uuid,
    /// Destination URL that receives webhook POSTs.
    pub target_url: String,
    /// Event types this registration subscribes to (e.g. "order.created").
    pub event_types: Vec<String>,
    /// Shared secret stored with the registration. Not used for signing.
    #[serde(default, skip_serializing)]
    pub secret: String,
    /// Inactive registrations receive no new jobs.
    pub active: bool,
    /// Timestamp when the registration was created.
    pub created_at: DateTime<Utc>,
}

impl Registration {
    /// Whether this registration receives events of the given type
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }

    /// Whether admission should fan an event of this type out to this registration
    pub fn accepts(&self, event_type: &str) -> bool {
        self.active && self.subscribes_to(event_type)
    }
}
