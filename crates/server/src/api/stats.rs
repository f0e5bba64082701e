// Dashboard stats HTTP routes

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use courier_delivery::{DeliveryPipeline, PipelineStats};

use super::common::{internal_error, ApiError};

/// App state for stats routes
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DeliveryPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<DeliveryPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/stats", get(get_stats))
        .route("/v1/stats/metrics", delete(clear_metrics))
        .with_state(state)
}

/// GET /v1/stats - Queue depths, backpressure flags and delivery metrics
#[utoipa::path(
    get,
    path = "/v1/stats",
    responses(
        (status = 200, description = "Pipeline snapshot", body = PipelineStats),
        (status = 500, description = "Internal server error")
    ),
    tag = "stats"
)]
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<PipelineStats>, ApiError> {
    let stats = state
        .pipeline
        .stats()
        .await
        .map_err(|e| internal_error("Failed to collect stats", e))?;

    Ok(Json(stats))
}

/// DELETE /v1/stats/metrics - Reset delivery metrics
#[utoipa::path(
    delete,
    path = "/v1/stats/metrics",
    responses(
        (status = 204, description = "Metrics cleared"),
        (status = 500, description = "Internal server error")
    ),
    tag = "stats"
)]
pub async fn clear_metrics(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .pipeline
        .metrics()
        .clear()
        .await
        .map_err(|e| internal_error("Failed to clear metrics", e))?;

    tracing::info!("metrics cleared");
    Ok(StatusCode::NO_CONTENT)
}
