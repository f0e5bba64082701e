// Event domain type and outbound webhook envelope
//
// Events are persisted unadmitted (`queued_at = None`) and admitted at most
// once by the drain scheduler or a direct producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Header carrying the event id on every webhook POST
pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-ID";

/// Header carrying the event type on every webhook POST
pub const HEADER_WEBHOOK_TYPE: &str = "X-Webhook-Type";

/// A business event emitted by a shop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Event {
    /// Unique identifier for the event.
    pub id: Uuid,
    /// ID of the shop that emitted the event.
    pub shop_id: Uuid,
    /// Event type (e.g. "order.created").
    pub event_type: String,
    /// Arbitrary JSON payload delivered as the envelope's `data`.
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub payload: serde_json::Value,
    /// Timestamp when the event was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the event was admitted into a work queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a new, unadmitted event
    pub fn new(shop_id: Uuid, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            shop_id,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            queued_at: None,
        }
    }

    /// Whether the event has been admitted
    pub fn is_admitted(&self) -> bool {
        self.queued_at.is_some()
    }

    /// Build the JSON envelope POSTed to registration targets
    pub fn envelope(&self) -> WebhookEnvelope {
        WebhookEnvelope {
            id: self.id,
            event_type: self.event_type.clone(),
            shop_id: self.shop_id,
            created_at: self.created_at,
            data: self.payload.clone(),
        }
    }
}

/// Body of an outbound webhook request.
///
/// Serialized as `{id, type, shopId, createdAt, data}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub shop_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}
