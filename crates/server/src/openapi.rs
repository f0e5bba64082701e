// OpenAPI document for the Courier API

use courier_core::{DeliveryAttempt, DeliveryStatus, Event, Registration, Shop};
use courier_delivery::{
    AttemptCounts, DeliveryCounts, LatencyStats, MetricsSnapshot, PipelineStats, ShopStats,
};
use utoipa::OpenApi;

use crate::api::{self, ErrorResponse, ListResponse};

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health,
        api::shops::create_shop,
        api::shops::list_shops,
        api::registrations::create_registration,
        api::registrations::list_registrations,
        api::events::create_events,
        api::events::get_event,
        api::events::list_attempts,
        api::stats::get_stats,
        api::stats::clear_metrics,
    ),
    components(
        schemas(
            Shop, Registration, Event, DeliveryAttempt, DeliveryStatus,
            PipelineStats, ShopStats, MetricsSnapshot, AttemptCounts, DeliveryCounts, LatencyStats,
            ErrorResponse,
            api::health::HealthResponse,
            api::shops::CreateShopRequest,
            api::registrations::CreateRegistrationRequest,
            api::events::AdmissionMode, api::events::EventInput,
            api::events::CreateEventsRequest, api::events::CreateEventsResponse,
            ListResponse<Shop>,
            ListResponse<Registration>,
            ListResponse<DeliveryAttempt>,
        )
    ),
    tags(
        (name = "health", description = "Liveness"),
        (name = "shops", description = "Shop (tenant) management"),
        (name = "registrations", description = "Webhook registration management"),
        (name = "events", description = "Event ingestion and delivery attempts"),
        (name = "stats", description = "Queue depth, backpressure and delivery metrics")
    ),
    info(
        title = "Courier API",
        version = "0.1.0",
        description = "Multi-tenant webhook delivery pipeline",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;
