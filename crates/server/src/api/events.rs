// Event ingestion HTTP routes
//
// Events are always stored first (unadmitted). The request mode decides what
// happens next:
// - direct: admit each event right away, fanning out jobs
// - gated: admit only while neither global nor shop backpressure is active;
//   skipped events stay stored for the drain to pick up
// - deferred: store only, the drain admits later

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use courier_core::{DeliveryAttempt, Event};
use courier_delivery::{AdmissionResult, DeliveryPipeline, NewEvent};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{bad_request, internal_error, not_found, store_error, ApiError, ListResponse};

/// Largest batch accepted in one request
pub const MAX_BATCH: usize = 10_000;

/// What to do with events after they are stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    #[default]
    Direct,
    Gated,
    Deferred,
}

/// One event to ingest
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EventInput {
    #[schema(example = "order.created")]
    pub event_type: String,
    /// Arbitrary JSON payload delivered as `data`.
    #[serde(default = "empty_payload")]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

/// Request to ingest events for a shop
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateEventsRequest {
    #[serde(default)]
    pub mode: AdmissionMode,
    pub events: Vec<EventInput>,
}

/// Ingestion summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEventsResponse {
    pub mode: AdmissionMode,
    /// Stored event IDs, in insertion order.
    pub event_ids: Vec<Uuid>,
    /// Events admitted by this request.
    pub admitted: usize,
    /// Events left for the drain because backpressure was active (gated mode).
    pub skipped: usize,
    /// Jobs enqueued across all admitted events.
    pub jobs: usize,
}

/// App state for event routes
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DeliveryPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<DeliveryPipeline>) -> Self {
        Self { pipeline }
    }

    /// True when gated admission has to leave the event for the drain
    async fn backpressured(&self, shop_id: Uuid) -> Result<bool, ApiError> {
        let backpressure = self.pipeline.backpressure();
        if backpressure
            .check_global()
            .await
            .map_err(|e| internal_error("Failed to check global backpressure", e))?
        {
            return Ok(true);
        }
        backpressure
            .check_tenant(shop_id)
            .await
            .map_err(|e| internal_error("Failed to check shop backpressure", e))
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/shops/:shop_id/events", post(create_events))
        .route("/v1/events/:event_id", get(get_event))
        .route("/v1/events/:event_id/attempts", get(list_attempts))
        .with_state(state)
}

/// POST /v1/shops/{shop_id}/events - Ingest one or more events
#[utoipa::path(
    post,
    path = "/v1/shops/{shop_id}/events",
    params(
        ("shop_id" = Uuid, Path, description = "Shop ID")
    ),
    request_body = CreateEventsRequest,
    responses(
        (status = 202, description = "Events stored", body = CreateEventsResponse),
        (status = 400, description = "Invalid request", body = super::ErrorResponse),
        (status = 404, description = "Shop not found", body = super::ErrorResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "events"
)]
pub async fn create_events(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
    Json(req): Json<CreateEventsRequest>,
) -> Result<(StatusCode, Json<CreateEventsResponse>), ApiError> {
    if req.events.is_empty() {
        return Err(bad_request("events must not be empty"));
    }
    if req.events.len() > MAX_BATCH {
        return Err(bad_request(format!(
            "at most {MAX_BATCH} events per request"
        )));
    }
    if req.events.iter().any(|e| e.event_type.trim().is_empty()) {
        return Err(bad_request("event_type must not be empty"));
    }

    let new_events = req
        .events
        .into_iter()
        .map(|e| NewEvent {
            shop_id,
            event_type: e.event_type,
            payload: e.payload,
        })
        .collect();
    let events = state
        .pipeline
        .store()
        .insert_events(new_events)
        .await
        .map_err(|e| store_error("Failed to insert events", e))?;

    let mut response = CreateEventsResponse {
        mode: req.mode,
        event_ids: events.iter().map(|e| e.id).collect(),
        admitted: 0,
        skipped: 0,
        jobs: 0,
    };

    if req.mode != AdmissionMode::Deferred {
        for event in &events {
            if req.mode == AdmissionMode::Gated && state.backpressured(shop_id).await? {
                response.skipped += 1;
                continue;
            }
            let result = state
                .pipeline
                .admit_event(event)
                .await
                .map_err(|e| internal_error("Failed to admit event", e))?;
            if let AdmissionResult::Admitted { jobs } = result {
                response.admitted += 1;
                response.jobs += jobs;
            }
        }
    }

    tracing::info!(
        shop_id = %shop_id,
        mode = ?response.mode,
        inserted = response.event_ids.len(),
        admitted = response.admitted,
        skipped = response.skipped,
        jobs = response.jobs,
        "events ingested"
    );
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /v1/events/{event_id} - Get an event
#[utoipa::path(
    get,
    path = "/v1/events/{event_id}",
    params(
        ("event_id" = Uuid, Path, description = "Event ID")
    ),
    responses(
        (status = 200, description = "Event found", body = Event),
        (status = 404, description = "Event not found", body = super::ErrorResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "events"
)]
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<Event>, ApiError> {
    state
        .pipeline
        .store()
        .get_event(event_id)
        .await
        .map_err(|e| store_error("Failed to get event", e))?
        .map(Json)
        .ok_or_else(|| not_found(format!("event not found: {event_id}")))
}

/// GET /v1/events/{event_id}/attempts - Delivery attempts of an event
#[utoipa::path(
    get,
    path = "/v1/events/{event_id}/attempts",
    params(
        ("event_id" = Uuid, Path, description = "Event ID")
    ),
    responses(
        (status = 200, description = "Attempts, one per registration", body = ListResponse<DeliveryAttempt>),
        (status = 500, description = "Internal server error")
    ),
    tag = "events"
)]
pub async fn list_attempts(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ListResponse<DeliveryAttempt>>, ApiError> {
    let attempts = state
        .pipeline
        .store()
        .list_attempts(event_id)
        .await
        .map_err(|e| store_error("Failed to list attempts", e))?;

    Ok(Json(ListResponse::new(attempts)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_defaults_to_direct() {
        let req: CreateEventsRequest = serde_json::from_value(serde_json::json!({
            "events": [{"event_type": "order.created"}]
        }))
        .unwrap();
        assert_eq!(req.mode, AdmissionMode::Direct);
        assert_eq!(req.events[0].payload, serde_json::json!({}));
    }

    #[test]
    fn test_mode_names() {
        let mode: AdmissionMode = serde_json::from_str("\"gated\"").unwrap();
        assert_eq!(mode, AdmissionMode::Gated);
        assert_eq!(
            serde_json::to_string(&AdmissionMode::Deferred).unwrap(),
            "\"deferred\""
        );
    }
}
