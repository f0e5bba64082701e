// Shop HTTP routes

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use courier_core::Shop;
use courier_delivery::DeliveryPipeline;
use serde::Deserialize;
use utoipa::ToSchema;

use super::common::{bad_request, store_error, ApiError, ListResponse};

/// Request to create a shop
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateShopRequest {
    /// Display name of the shop.
    #[schema(example = "Acme Corp")]
    pub name: String,
}

/// App state for shop routes
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
        .route("/v1/shops", post(create_shop).get(list_shops))
        .with_state(state)
}

/// POST /v1/shops - Create a shop
#[utoipa::path(
    post,
    path = "/v1/shops",
    request_body = CreateShopRequest,
    responses(
        (status = 201, description = "Shop created", body = Shop),
        (status = 400, description = "Invalid request", body = super::ErrorResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "shops"
)]
pub async fn create_shop(
    State(state): State<AppState>,
    Json(req): Json<CreateShopRequest>,
) -> Result<(StatusCode, Json<Shop>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    let shop = state
        .pipeline
        .store()
        .create_shop(name)
        .await
        .map_err(|e| store_error("Failed to create shop", e))?;

    tracing::info!(shop_id = %shop.id, name = %shop.name, "shop created");
    Ok((StatusCode::CREATED, Json(shop)))
}

/// GET /v1/shops - List shops
#[utoipa::path(
    get,
    path = "/v1/shops",
    responses(
        (status = 200, description = "List of shops", body = ListResponse<Shop>),
        (status = 500, description = "Internal server error")
    ),
    tag = "shops"
)]
pub async fn list_shops(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Shop>>, ApiError> {
    let shops = state
        .pipeline
        .store()
        .list_shops()
        .await
        .map_err(|e| store_error("Failed to list shops", e))?;

    Ok(Json(ListResponse::new(shops)))
}
