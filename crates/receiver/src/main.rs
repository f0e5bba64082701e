// Courier test receiver
// Decision: Plain axum app with no persistence; counters reset on restart

use anyhow::{Context, Result};
use courier_core::telemetry::{init_telemetry, TelemetryConfig};
use courier_receiver::{router, ReceiverConfig, ReceiverState};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(
        TelemetryConfig::from_env()
            .with_default_service_name("courier-receiver")
            .with_default_filter("courier_receiver=info"),
    )?;

    let config = ReceiverConfig::from_env().context("Invalid receiver configuration")?;
    let bind_addr = config.bind_addr;
    tracing::info!(
        latency_ms = config.latency.as_millis() as u64,
        failure_rate = config.failure_rate,
        failure_status = config.failure_status,
        "receiver configured"
    );

    let app = router(ReceiverState::new(config)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!(address = %bind_addr, "receiver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Server error")?;

    Ok(())
}
