// Delivery attempt domain types
//
// One row per (event, registration) pair records the progress of delivering
// that event to that destination. `success` and `dead` are terminal.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Delivery attempt status.
/// - `pending`: Created, no attempt has finished yet
/// - `success`: Delivered with a 2xx response
/// - `failed`: Last attempt failed, retries remain
/// - `dead`: Retries exhausted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Dead,
}

impl DeliveryStatus {
    /// Terminal rows are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown delivery status: {0}")]
pub struct ParseDeliveryStatusError(pub String);

impl FromStr for DeliveryStatus {
    type Err = ParseDeliveryStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "dead" => Ok(DeliveryStatus::Dead),
            other => Err(ParseDeliveryStatusError(other.to_string())),
        }
    }
}

/// Record of delivering one event to one registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct DeliveryAttempt {
    /// Unique identifier for the attempt row.
    pub id: Uuid,
    /// Event being delivered.
    pub event_id: Uuid,
    /// Destination registration.
    pub registration_id: Uuid,
    /// Current status.
    pub status: DeliveryStatus,
    /// Number of finished delivery tries (monotonic).
    pub attempts: u32,
    /// When the last try finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Informational; the job store owns retry scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// HTTP status of the last response, if one was received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    /// Body of the last response, or the transport error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Timestamp when the row was created.
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Fresh pending row for an (event, registration) pair
    pub fn pending(event_id: Uuid, registration_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id,
            registration_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            response_code: None,
            response_body: None,
            created_at: Utc::now(),
        }
    }
}
