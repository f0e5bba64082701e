//! In-memory implementation of SharedState

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::store::{SharedState, StateError};

enum Value {
    Str(String),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of SharedState
///
/// Keys expire lazily: an expired entry is dropped the next time any
/// operation touches it. All operations on one store are serialized by a
/// single mutex, which makes every primitive atomic.
///
/// # Example
///
/// ```
/// use courier_delivery::state::InMemorySharedState;
///
/// let state = InMemorySharedState::new();
/// assert_eq!(state.key_count(), 0);
/// ```
pub struct InMemorySharedState {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySharedState {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for InMemorySharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop `key` if it has expired, then return its live entry
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str, expected: &'static str) -> StateError {
    StateError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn increment<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Entry, StateError> {
    if live(entries, key).is_none() {
        entries.insert(key.to_string(), Entry::new(Value::Str("0".to_string())));
    }
    let entry = entries
        .get_mut(key)
        .ok_or_else(|| StateError::Backend(format!("key {key} vanished during increment")))?;

    let Value::Str(raw) = &mut entry.value else {
        return Err(wrong_type(key, "string"));
    };
    let current: i64 = raw
        .parse()
        .map_err(|_| StateError::NotAnInteger(key.to_string()))?;
    *raw = (current + 1).to_string();
    Ok(entry)
}

fn counter_value(entry: &Entry, key: &str) -> Result<i64, StateError> {
    match &entry.value {
        Value::Str(raw) => raw
            .parse()
            .map_err(|_| StateError::NotAnInteger(key.to_string())),
        _ => Err(wrong_type(key, "string")),
    }
}

#[async_trait]
impl SharedState for InMemorySharedState {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StateError> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock();
        Ok(live(&mut entries, key).is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock();
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StateError> {
        let mut entries = self.entries.lock();
        let entry = increment(&mut entries, key)?;
        counter_value(entry, key)
    }

    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<i64, StateError> {
        let mut entries = self.entries.lock();
        let entry = increment(&mut entries, key)?;
        if entry.expires_at.is_none() {
            entry.expires_at = Some(Instant::now() + window);
        }
        counter_value(entry, key)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StateError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        Ok(live(&mut entries, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock();
        if live(&mut entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new())));
        }
        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key, "set")),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock();
        let removed = match live(&mut entries, key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Value::Set(set)) => (set.remove(member), set.is_empty()),
            Some(_) => return Err(wrong_type(key, "set")),
        };
        // Empty sets disappear, as in Redis
        if removed.1 {
            entries.remove(key);
        }
        Ok(removed.0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StateError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StateError> {
        let mut entries = self.entries.lock();
        if live(&mut entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => {
                list.push_front(value.to_string());
                list.truncate(max_len);
                Ok(())
            }
            _ => Err(wrong_type(key, "list")),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StateError> {
        let mut entries = self.entries.lock();
        match live(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }
}
