//! Courier HTTP server
//!
//! Exposes shop, registration and event ingestion endpoints plus dashboard
//! stats over a [`DeliveryPipeline`]. The binary in `main.rs` also runs the
//! pipeline's admission scheduler and delivery workers.

pub mod api;
pub mod config;
pub mod openapi;

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::Router;
use courier_delivery::DeliveryPipeline;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use config::ServerConfig;
pub use openapi::ApiDoc;

/// API routes, health and Swagger UI for `pipeline`
///
/// `store` names the durable store in the health response.
pub fn router(pipeline: Arc<DeliveryPipeline>, store: &'static str) -> Router {
    Router::new()
        .merge(api::health::routes(api::health::HealthState { store }))
        .merge(api::shops::routes(api::shops::AppState::new(pipeline.clone())))
        .merge(api::registrations::routes(
            api::registrations::AppState::new(pipeline.clone()),
        ))
        .merge(api::events::routes(api::events::AppState::new(
            pipeline.clone(),
        )))
        .merge(api::stats::routes(api::stats::AppState::new(pipeline)))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
}

/// Add the CORS layer when origins are configured, then request tracing
pub fn with_layers(app: Router, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let app = if origins.is_empty() {
        app
    } else {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
        )
    };

    app.layer(TraceLayer::new_for_http())
}
