//! Shared state key layout

use uuid::Uuid;

/// Set of shop ids whose queues may hold work
pub const ACTIVE_SHOPS: &str = "active_shop_queues";

/// Global backpressure flag, present only while active
pub const GLOBAL_BACKPRESSURE: &str = "backpressure:global:active";

/// RFC 3339 timestamp of the last global backpressure recomputation
pub const GLOBAL_BACKPRESSURE_CHECKED_AT: &str = "backpressure:global:checked_at";

pub const METRICS_ATTEMPTS_TOTAL: &str = "metrics:attempts:total";
pub const METRICS_ATTEMPTS_SUCCESS: &str = "metrics:attempts:success";
pub const METRICS_DELIVERIES_SUCCESS: &str = "metrics:deliveries:success";
pub const METRICS_DELIVERIES_DEAD: &str = "metrics:deliveries:dead";
pub const METRICS_LATENCY_E2E: &str = "metrics:latency:e2e";

/// Per-shop backpressure flag
pub fn shop_backpressure(shop_id: Uuid) -> String {
    format!("backpressure:shop:{shop_id}:active")
}

/// Rolling failure counter for a registration
pub fn circuit_failures(registration_id: Uuid) -> String {
    format!("circuit:failures:{registration_id}")
}

/// Open flag for a registration; expires after the cooldown
pub fn circuit_open(registration_id: Uuid) -> String {
    format!("circuit:open:{registration_id}")
}
