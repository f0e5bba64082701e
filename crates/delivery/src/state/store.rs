//! SharedState trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Error type for shared state operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// Key holds a different kind of value
    #[error("wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// Counter operation on a non-integer value
    #[error("value at key {0} is not an integer")]
    NotAnInteger(String),

    /// Backend failure
    #[error("shared state backend error: {0}")]
    Backend(String),
}

/// Low-latency keyed store shared by every loop in the pipeline
///
/// Holds the active-shop set, circuit counters and flags, backpressure flags
/// and delivery metrics. Every mutation is a single atomic primitive;
/// callers never read-modify-write across calls.
///
/// Sets are returned in lexicographic order.
#[async_trait]
pub trait SharedState: Send + Sync + 'static {
    /// Get a string value
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;

    /// Set a string value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StateError>;

    /// Whether the key exists (and has not expired)
    async fn exists(&self, key: &str) -> Result<bool, StateError>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool, StateError>;

    /// Increment an integer counter, creating it at 0 first
    async fn incr(&self, key: &str) -> Result<i64, StateError>;

    /// Increment a counter and give it `window` expiry if it has none yet
    ///
    /// Implements a single decaying bucket: the first increment starts the
    /// window, later increments inside it do not extend it.
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<i64, StateError>;

    /// Remaining time to live, `None` when the key is missing or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StateError>;

    /// Add a member to a set, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StateError>;

    /// Remove a member from a set, returning whether it was present
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StateError>;

    /// All members of a set
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StateError>;

    /// Push to the head of a list and trim it to `max_len` entries
    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize)
        -> Result<(), StateError>;

    /// Full contents of a list, newest first
    async fn lrange(&self, key: &str) -> Result<Vec<String>, StateError>;
}
