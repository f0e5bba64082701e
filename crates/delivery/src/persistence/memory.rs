//! In-memory implementation of DeliveryStore for testing and dev mode

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{DeliveryAttempt, Event, Registration, Shop};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// In-memory implementation of DeliveryStore
///
/// Stores all data in memory and provides the same semantics as the
/// PostgreSQL implementation, including the conditional admission update
/// and the terminal-status guard on attempt rows.
///
/// # Example
///
/// ```
/// use courier_delivery::InMemoryDeliveryStore;
///
/// let store = InMemoryDeliveryStore::new();
/// assert_eq!(store.event_count(), 0);
/// ```
pub struct InMemoryDeliveryStore {
    shops: RwLock<HashMap<Uuid, Shop>>,
    registrations: RwLock<HashMap<Uuid, Registration>>,
    events: RwLock<HashMap<Uuid, Event>>,
    attempts: RwLock<Attempts>,
}

#[derive(Default)]
struct Attempts {
    by_id: HashMap<Uuid, DeliveryAttempt>,
    by_pair: HashMap<(Uuid, Uuid), Uuid>,
}

impl InMemoryDeliveryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            shops: RwLock::new(HashMap::new()),
            registrations: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            attempts: RwLock::new(Attempts::default()),
        }
    }

    /// Get the number of events
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Get the number of attempt rows
    pub fn attempt_count(&self) -> usize {
        self.attempts.read().by_id.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.shops.write().clear();
        self.registrations.write().clear();
        self.events.write().clear();
        *self.attempts.write() = Attempts::default();
    }

    fn ensure_shop(&self, shop_id: Uuid) -> Result<(), StoreError> {
        if self.shops.read().contains_key(&shop_id) {
            Ok(())
        } else {
            Err(StoreError::ShopNotFound(shop_id))
        }
    }
}

impl Default for InMemoryDeliveryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fifo_key(event: &Event) -> (DateTime<Utc>, Uuid) {
    (event.created_at, event.id)
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn create_shop(&self, name: &str) -> Result<Shop, StoreError> {
        let shop = Shop::new(name);
        self.shops.write().insert(shop.id, shop.clone());
        Ok(shop)
    }

    async fn get_shop(&self, shop_id: Uuid) -> Result<Option<Shop>, StoreError> {
        Ok(self.shops.read().get(&shop_id).cloned())
    }

    async fn list_shops(&self) -> Result<Vec<Shop>, StoreError> {
        let mut shops: Vec<Shop> = self.shops.read().values().cloned().collect();
        shops.sort_by_key(|s| (s.created_at, s.id));
        Ok(shops)
    }

    async fn create_registration(
        &self,
        registration: NewRegistration,
    ) -> Result<Registration, StoreError> {
        self.ensure_shop(registration.shop_id)?;
        let created = Registration {
            id: Uuid::now_v7(),
            shop_id: registration.shop_id,
            target_url: registration.target_url,
            event_types: registration.event_types,
            secret: registration.secret,
            active: registration.active,
            created_at: Utc::now(),
        };
        self.registrations
            .write()
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_registration(
        &self,
        registration_id: Uuid,
    ) -> Result<Option<Registration>, StoreError> {
        Ok(self.registrations.read().get(&registration_id).cloned())
    }

    async fn list_registrations(&self, shop_id: Uuid) -> Result<Vec<Registration>, StoreError> {
        let mut registrations: Vec<Registration> = self
            .registrations
            .read()
            .values()
            .filter(|r| r.shop_id == shop_id)
            .cloned()
            .collect();
        registrations.sort_by_key(|r| (r.created_at, r.id));
        Ok(registrations)
    }

    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        for event in &events {
            self.ensure_shop(event.shop_id)?;
        }
        let created: Vec<Event> = events
            .into_iter()
            .map(|e| Event::new(e.shop_id, e.event_type, e.payload))
            .collect();

        let mut stored = self.events.write();
        for event in &created {
            stored.insert(event.id, event.clone());
        }
        Ok(created)
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.events.read().get(&event_id).cloned())
    }

    async fn shops_with_unadmitted_events(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut shops: Vec<Uuid> = self
            .events
            .read()
            .values()
            .filter(|e| !e.is_admitted())
            .map(|e| e.shop_id)
            .collect();
        shops.sort();
        shops.dedup();
        Ok(shops)
    }

    async fn oldest_unadmitted_event(&self, shop_id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| e.shop_id == shop_id && !e.is_admitted())
            .min_by_key(|e| fifo_key(e))
            .cloned())
    }

    async fn unadmitted_event_count(&self, shop_id: Option<Uuid>) -> Result<u64, StoreError> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| !e.is_admitted() && shop_id.map_or(true, |s| e.shop_id == s))
            .count() as u64)
    }

    async fn mark_event_admitted(
        &self,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut events = self.events.write();
        match events.get_mut(&event_id) {
            Some(event) if event.queued_at.is_none() => {
                event.queued_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_or_create_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<DeliveryAttempt, StoreError> {
        let mut attempts = self.attempts.write();
        if let Some(id) = attempts.by_pair.get(&(event_id, registration_id)).copied() {
            if let Some(existing) = attempts.by_id.get(&id) {
                return Ok(existing.clone());
            }
        }

        let attempt = DeliveryAttempt::pending(event_id, registration_id);
        attempts
            .by_pair
            .insert((event_id, registration_id), attempt.id);
        attempts.by_id.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn find_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        let attempts = self.attempts.read();
        Ok(attempts
            .by_pair
            .get(&(event_id, registration_id))
            .and_then(|id| attempts.by_id.get(id))
            .cloned())
    }

    async fn record_attempt_outcome(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        max_attempts: u32,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        let mut attempts = self.attempts.write();
        let attempt = attempts
            .by_id
            .get_mut(&attempt_id)
            .ok_or(StoreError::AttemptNotFound(attempt_id))?;

        if attempt.status.is_terminal() {
            return Ok(None);
        }

        attempt.attempts += 1;
        attempt.status = outcome.status_after(attempt.attempts, max_attempts);
        attempt.response_code = outcome.response_code;
        attempt.response_body = outcome.response_body;
        attempt.last_attempt_at = Some(outcome.attempted_at);
        Ok(Some(attempt.clone()))
    }

    async fn list_attempts(&self, event_id: Uuid) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let mut rows: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .by_id
            .values()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.created_at, a.id));
        Ok(rows)
    }
}
