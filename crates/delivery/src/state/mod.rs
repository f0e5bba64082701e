//! Shared low-latency state
//!
//! This module provides:
//! - [`SharedState`] trait for the keyed store shared by admission and workers
//! - [`InMemorySharedState`] for tests and single-process deployments
//! - [`keys`] with the key layout used across the pipeline

pub mod keys;
mod memory;
mod store;

pub use memory::InMemorySharedState;
pub use store::{SharedState, StateError};
