//! Courier test receiver
//!
//! A webhook target for local runs. `POST /webhook` logs each delivery and
//! answers 200, unless configured (or asked per registration through the
//! `fail_rate` query parameter) to fail some share of deliveries. Every
//! response can be delayed to simulate a slow consumer.

pub mod config;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use courier_core::{HEADER_WEBHOOK_ID, HEADER_WEBHOOK_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use config::ReceiverConfig;

/// Shared receiver state
#[derive(Clone)]
pub struct ReceiverState {
    config: Arc<ReceiverConfig>,
    received: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ReceiverState {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config: Arc::new(config),
            received: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Per-registration overrides carried in the target URL
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Label logged with each delivery
    pub name: Option<String>,
    pub fail_rate: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub received: u64,
    pub failed: u64,
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

async fn webhook(
    State(state): State<ReceiverState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let count = state.received.fetch_add(1, Ordering::Relaxed) + 1;
    let name = query.name.as_deref().unwrap_or("default");

    tracing::info!(
        name,
        count,
        webhook_id = header(&headers, HEADER_WEBHOOK_ID),
        webhook_type = header(&headers, HEADER_WEBHOOK_TYPE),
        "webhook received"
    );
    tracing::debug!(name, body = %body, "webhook body");

    if !state.config.latency.is_zero() {
        tokio::time::sleep(state.config.latency).await;
    }

    let fail_rate = query
        .fail_rate
        .unwrap_or(state.config.failure_rate)
        .clamp(0.0, 1.0);
    if rand::random::<f64>() < fail_rate {
        state.failed.fetch_add(1, Ordering::Relaxed);
        let status = StatusCode::from_u16(state.config.failure_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::warn!(name, status = status.as_u16(), "simulated failure");
        return (status, Json(json!({ "received": false })));
    }

    (StatusCode::OK, Json(json!({ "received": true })))
}

async fn health(State(state): State<ReceiverState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        received: state.received(),
        failed: state.failed(),
    })
}
