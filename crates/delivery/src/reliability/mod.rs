//! Reliability patterns for webhook delivery
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded retry with exponential backoff for queued jobs
//! - [`CircuitBreaker`] - Per-registration failure isolation in shared state

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureRecord};
pub use retry::RetryPolicy;
