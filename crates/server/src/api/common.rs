// Common DTOs for public API
//
// These types are shared across multiple API endpoints.

use axum::http::StatusCode;
use axum::Json;
use courier_delivery::StoreError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Error half of handler results
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn bad_request(message: impl Into<String>) -> ApiError {
    ErrorResponse::new(message).into_response(StatusCode::BAD_REQUEST)
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    ErrorResponse::new(message).into_response(StatusCode::NOT_FOUND)
}

/// Log and hide an unexpected failure
pub fn internal_error(context: &str, error: impl std::fmt::Display) -> ApiError {
    tracing::error!("{}: {}", context, error);
    ErrorResponse::new("internal server error").into_response(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Map store errors onto HTTP statuses
pub fn store_error(context: &str, error: StoreError) -> ApiError {
    match error {
        StoreError::ShopNotFound(id) => not_found(format!("shop not found: {id}")),
        StoreError::AttemptNotFound(id) => not_found(format!("delivery attempt not found: {id}")),
        StoreError::InvalidInput(msg) => bad_request(msg),
        other => internal_error(context, other),
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}
