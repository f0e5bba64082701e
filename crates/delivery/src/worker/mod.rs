//! Delivery workers
//!
//! This module provides:
//! - [`WebhookClient`] - Outbound POST of event envelopes
//! - [`WebhookDeliverer`] - One delivery with attempt bookkeeping and circuit checks
//! - [`DeliveryWorker`] - The claim/deliver/settle loop over active shops

mod client;
mod delivery;
mod worker_loop;

pub use client::{WebhookClient, WebhookResponse, MAX_RESPONSE_BODY_BYTES};
pub use delivery::{DeliveryConfig, DeliveryError, DeliveryOutcome, WebhookDeliverer};
pub use worker_loop::{DeliveryWorker, JobDrop, WorkerConfig, WorkerError, WorkerTick};
