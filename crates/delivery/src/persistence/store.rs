//! DeliveryStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{DeliveryAttempt, DeliveryStatus, Event, Registration, Shop};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Shop not found
    #[error("shop not found: {0}")]
    ShopNotFound(Uuid),

    /// Delivery attempt not found
    #[error("delivery attempt not found: {0}")]
    AttemptNotFound(Uuid),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Definition of a registration to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRegistration {
    pub shop_id: Uuid,
    pub target_url: String,
    pub event_types: Vec<String>,
    pub secret: String,
    pub active: bool,
}

/// Definition of an event to insert (unadmitted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub shop_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Result of one finished delivery try
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub succeeded: bool,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl AttemptOutcome {
    /// Status a row moves to once this try brings it to `attempts`
    pub fn status_after(&self, attempts: u32, max_attempts: u32) -> DeliveryStatus {
        if self.succeeded {
            DeliveryStatus::Success
        } else if attempts >= max_attempts {
            DeliveryStatus::Dead
        } else {
            DeliveryStatus::Failed
        }
    }
}

/// Durable store for shops, registrations, events and delivery attempts
///
/// Implementations must guarantee:
/// - `mark_event_admitted` sets `queued_at` only while it is null
/// - at most one attempt row exists per (event, registration)
/// - `record_attempt_outcome` increments `attempts` atomically and never
///   touches a row that is already `success` or `dead`
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    // =========================================================================
    // Shops and registrations
    // =========================================================================

    async fn create_shop(&self, name: &str) -> Result<Shop, StoreError>;

    async fn get_shop(&self, shop_id: Uuid) -> Result<Option<Shop>, StoreError>;

    /// All shops, oldest first
    async fn list_shops(&self) -> Result<Vec<Shop>, StoreError>;

    /// Create a registration; fails with `ShopNotFound` for unknown shops
    async fn create_registration(
        &self,
        registration: NewRegistration,
    ) -> Result<Registration, StoreError>;

    async fn get_registration(
        &self,
        registration_id: Uuid,
    ) -> Result<Option<Registration>, StoreError>;

    /// Registrations of a shop, oldest first (active or not)
    async fn list_registrations(&self, shop_id: Uuid) -> Result<Vec<Registration>, StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Insert unadmitted events; fails with `ShopNotFound` for unknown shops
    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError>;

    /// Insert one unadmitted event
    async fn insert_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        self.insert_events(vec![event])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Database("insert returned no rows".to_string()))
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError>;

    /// Distinct shops with at least one unadmitted event, ordered by id
    async fn shops_with_unadmitted_events(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Oldest unadmitted event of a shop (by created_at, then id)
    async fn oldest_unadmitted_event(&self, shop_id: Uuid) -> Result<Option<Event>, StoreError>;

    /// Number of unadmitted events, for one shop or all
    async fn unadmitted_event_count(&self, shop_id: Option<Uuid>) -> Result<u64, StoreError>;

    /// Set `queued_at` if still null; returns whether this call admitted it
    async fn mark_event_admitted(
        &self,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Delivery attempts
    // =========================================================================

    /// Fetch the attempt row for a pair, creating it as pending if absent
    async fn get_or_create_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<DeliveryAttempt, StoreError>;

    async fn find_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<DeliveryAttempt>, StoreError>;

    /// Apply a finished try: attempts += 1 and status per [`AttemptOutcome::status_after`]
    ///
    /// Returns the updated row, or `None` when the row was already terminal.
    async fn record_attempt_outcome(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        max_attempts: u32,
    ) -> Result<Option<DeliveryAttempt>, StoreError>;

    /// All attempt rows for an event
    async fn list_attempts(&self, event_id: Uuid) -> Result<Vec<DeliveryAttempt>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(succeeded: bool) -> AttemptOutcome {
        AttemptOutcome {
            succeeded,
            response_code: Some(if succeeded { 200 } else { 500 }),
            response_body: None,
            attempted_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_after_failure() {
        assert_eq!(outcome(false).status_after(1, 5), DeliveryStatus::Failed);
        assert_eq!(outcome(false).status_after(4, 5), DeliveryStatus::Failed);
        assert_eq!(outcome(false).status_after(5, 5), DeliveryStatus::Dead);
    }

    #[test]
    fn test_status_after_success_ignores_attempt_count() {
        assert_eq!(outcome(true).status_after(5, 5), DeliveryStatus::Success);
        assert_eq!(outcome(true).status_after(1, 5), DeliveryStatus::Success);
    }
}
