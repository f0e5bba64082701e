//! Persistence layer for webhook delivery
//!
//! This module provides:
//! - [`DeliveryStore`] trait for shops, registrations, events and attempts
//! - [`InMemoryDeliveryStore`] for testing and dev mode
//! - [`PostgresDeliveryStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryDeliveryStore;
pub use postgres::PostgresDeliveryStore;
pub use store::{AttemptOutcome, DeliveryStore, NewEvent, NewRegistration, StoreError};
