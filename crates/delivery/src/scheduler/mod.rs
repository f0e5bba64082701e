//! Admission scheduling
//!
//! This module provides:
//! - [`BackpressureController`] - Global and per-shop admission throttling
//! - [`Admission`] - At-most-once fan-out of an event into its shop queue
//! - [`AdmissionScheduler`] - Round-robin drain of unadmitted events

mod admission;
mod backpressure;

use std::time::Duration;

use tokio::sync::watch;

pub use admission::{
    Admission, AdmissionError, AdmissionResult, AdmissionScheduler, AdmissionTick,
    SchedulerConfig,
};
pub use backpressure::{
    BackpressureConfig, BackpressureController, BackpressureError, BackpressureScope,
};

/// Sleep for `duration` unless shutdown is signalled first
///
/// Returns true if shutdown was requested.
pub(crate) async fn idle_wait(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}
