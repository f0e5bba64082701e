// Courier core domain types
//
// Entities shared by the delivery pipeline, the HTTP server and the CLI.
//
// Key design decisions:
// - Entities are plain serde structs; persistence maps rows into them
// - Registrations are immutable once created (no update path)
// - An event is admitted at most once (`queued_at` is set exactly once)
// - A delivery attempt row is unique per (event, registration) pair

pub mod attempt;
pub mod event;
pub mod registration;
pub mod shop;

// Telemetry (tracing-subscriber setup for binaries)
pub mod telemetry;

pub use attempt::{DeliveryAttempt, DeliveryStatus, ParseDeliveryStatusError};
pub use event::{Event, WebhookEnvelope, HEADER_WEBHOOK_ID, HEADER_WEBHOOK_TYPE};
pub use registration::Registration;
pub use shop::Shop;
