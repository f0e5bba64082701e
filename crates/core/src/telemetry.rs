// Telemetry Module
//
// Structured logging setup shared by the Courier binaries:
// - EnvFilter from RUST_LOG / LOG_LEVEL with a per-binary default
// - Human-readable or JSON fmt output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Configuration for tracing output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "courier_delivery=debug")
    pub log_filter: Option<String>,
    /// Output format
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            log_filter: None,
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "courier")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: "json" for JSON lines, anything else for pretty output
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "courier".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: std::env::var("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        }
    }

    /// Override the service name if it was not set explicitly
    pub fn with_default_service_name(mut self, name: &str) -> Self {
        if self.service_name == "courier" {
            self.service_name = name.to_string();
        }
        self
    }

    /// Use this filter when neither RUST_LOG nor LOG_LEVEL is set
    pub fn with_default_filter(mut self, filter: &str) -> Self {
        if self.log_filter.is_none() {
            self.log_filter = Some(filter.to_string());
        }
        self
    }
}

/// Telemetry initialization errors
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("global tracing subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Install the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use courier_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     init_telemetry(TelemetryConfig::from_env().with_default_filter("info"))?;
///     Ok(())
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(service = %config.service_name, format = ?config.format, "telemetry initialized");
    Ok(())
}
