// Webhook registration HTTP routes
//
// Registrations are immutable once created; there is no update or delete.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use courier_core::Registration;
use courier_delivery::{DeliveryPipeline, NewRegistration};
use rand::Rng;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{bad_request, not_found, store_error, ApiError, ListResponse};

/// Request to register a webhook target for a shop
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateRegistrationRequest {
    /// URL that receives the webhook POSTs.
    #[schema(example = "http://localhost:3001/webhook?name=acme-primary")]
    pub target_url: String,
    /// Event types to subscribe to.
    #[schema(example = json!(["order.created", "order.updated"]))]
    pub event_types: Vec<String>,
    /// Shared secret. Generated when omitted.
    #[serde(default)]
    pub secret: Option<String>,
    /// Inactive registrations receive no jobs.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Column width of `webhook_registrations.secret`
const MAX_SECRET_LEN: usize = 64;

/// 32 random bytes, hex encoded
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn validate(req: &CreateRegistrationRequest) -> Result<(), ApiError> {
    let url = req.target_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(bad_request("target_url must be an http(s) URL"));
    }
    if req.event_types.is_empty() || req.event_types.iter().any(|t| t.trim().is_empty()) {
        return Err(bad_request("event_types must list at least one non-empty type"));
    }
    if req.secret.as_ref().is_some_and(|s| s.is_empty() || s.len() > MAX_SECRET_LEN) {
        return Err(bad_request(format!(
            "secret must be 1 to {MAX_SECRET_LEN} bytes"
        )));
    }
    Ok(())
}

/// App state for registration routes
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
        .route(
            "/v1/shops/:shop_id/registrations",
            post(create_registration).get(list_registrations),
        )
        .with_state(state)
}

/// POST /v1/shops/{shop_id}/registrations - Register a webhook target
#[utoipa::path(
    post,
    path = "/v1/shops/{shop_id}/registrations",
    params(
        ("shop_id" = Uuid, Path, description = "Shop ID")
    ),
    request_body = CreateRegistrationRequest,
    responses(
        (status = 201, description = "Registration created", body = Registration),
        (status = 400, description = "Invalid request", body = super::ErrorResponse),
        (status = 404, description = "Shop not found", body = super::ErrorResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "registrations"
)]
pub async fn create_registration(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
    Json(req): Json<CreateRegistrationRequest>,
) -> Result<(StatusCode, Json<Registration>), ApiError> {
    validate(&req)?;

    let registration = state
        .pipeline
        .store()
        .create_registration(NewRegistration {
            shop_id,
            target_url: req.target_url.trim().to_string(),
            event_types: req.event_types,
            secret: req.secret.unwrap_or_else(generate_secret),
            active: req.active,
        })
        .await
        .map_err(|e| store_error("Failed to create registration", e))?;

    tracing::info!(
        shop_id = %shop_id,
        registration_id = %registration.id,
        target_url = %registration.target_url,
        "registration created"
    );
    Ok((StatusCode::CREATED, Json(registration)))
}

/// GET /v1/shops/{shop_id}/registrations - List a shop's registrations
#[utoipa::path(
    get,
    path = "/v1/shops/{shop_id}/registrations",
    params(
        ("shop_id" = Uuid, Path, description = "Shop ID")
    ),
    responses(
        (status = 200, description = "List of registrations", body = ListResponse<Registration>),
        (status = 404, description = "Shop not found", body = super::ErrorResponse),
        (status = 500, description = "Internal server error")
    ),
    tag = "registrations"
)]
pub async fn list_registrations(
    State(state): State<AppState>,
    Path(shop_id): Path<Uuid>,
) -> Result<Json<ListResponse<Registration>>, ApiError> {
    let store = state.pipeline.store();
    if store
        .get_shop(shop_id)
        .await
        .map_err(|e| store_error("Failed to get shop", e))?
        .is_none()
    {
        return Err(not_found(format!("shop not found: {shop_id}")));
    }

    let registrations = store
        .list_registrations(shop_id)
        .await
        .map_err(|e| store_error("Failed to list registrations", e))?;

    Ok(Json(ListResponse::new(registrations)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, types: &[&str]) -> CreateRegistrationRequest {
        CreateRegistrationRequest {
            target_url: url.to_string(),
            event_types: types.iter().map(|t| t.to_string()).collect(),
            secret: None,
            active: true,
        }
    }

    #[test]
    fn test_generated_secret_is_hex() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_validation() {
        assert!(validate(&request("http://localhost:3001/webhook", &["order.created"])).is_ok());
        assert!(validate(&request("ftp://example.com", &["order.created"])).is_err());
        assert!(validate(&request("https://example.com", &[])).is_err());
        assert!(validate(&request("https://example.com", &[" "])).is_err());

        let mut long_secret = request("https://example.com", &["a"]);
        long_secret.secret = Some("x".repeat(65));
        assert!(validate(&long_secret).is_err());
    }

    #[test]
    fn test_active_defaults_to_true() {
        let req: CreateRegistrationRequest = serde_json::from_value(serde_json::json!({
            "target_url": "http://localhost/webhook",
            "event_types": ["order.created"]
        }))
        .unwrap();
        assert!(req.active);
        assert!(req.secret.is_none());
    }
}
