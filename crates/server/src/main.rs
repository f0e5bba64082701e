// Courier server
// Decision: Admission scheduler and delivery workers run in-process next to the HTTP API
// Decision: Without DATABASE_URL the server runs on the in-memory store (dev mode, nothing survives a restart)
// Decision: Ctrl-C stops the HTTP listener and signals the pipeline loops, then waits for both
// Decision: A pipeline loop that stops with an error takes the whole process down with it

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::telemetry::{init_telemetry, TelemetryConfig};
use courier_delivery::{
    DeliveryPipeline, DeliveryStore, InMemoryDeliveryStore, PipelineConfig, PostgresDeliveryStore,
};
use courier_server::{router, with_layers, ServerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG / LOG_LEVEL: Log filter (default: "courier_server=debug,courier_delivery=info,tower_http=debug")
    // - LOG_FORMAT: "json" for JSON lines
    init_telemetry(
        TelemetryConfig::from_env()
            .with_default_service_name("courier-server")
            .with_default_filter("courier_server=debug,courier_delivery=info,tower_http=debug"),
    )?;

    tracing::info!("courier-server starting...");

    let server_config = ServerConfig::from_env().context("Invalid server configuration")?;
    let pipeline_config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;

    let (store, store_kind): (Arc<dyn DeliveryStore>, &'static str) =
        match &server_config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .context("Failed to connect to database")?;
                let store = PostgresDeliveryStore::new(pool);
                store.migrate().await.context("Failed to run migrations")?;
                tracing::info!("Connected to database");
                (Arc::new(store), "postgres")
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                (Arc::new(InMemoryDeliveryStore::new()), "memory")
            }
        };

    let pipeline = Arc::new(
        DeliveryPipeline::in_memory(store, pipeline_config)
            .context("Failed to assemble delivery pipeline")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline_done = pipeline.spawn(shutdown_rx).join();
    tokio::pin!(pipeline_done);

    let app = with_layers(
        router(pipeline.clone(), store_kind),
        &server_config.cors_allowed_origins,
    );

    let listener = tokio::net::TcpListener::bind(server_config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!(address = %server_config.bind_addr, store = store_kind, "HTTP server listening");

    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .into_future(),
    );

    tokio::select! {
        served = &mut server => {
            served.context("HTTP server task failed")?.context("Server error")?;
            pipeline_done
                .await
                .context("Delivery pipeline stopped with an error")?;
        }
        stopped = &mut pipeline_done => {
            if let Err(e) = stopped {
                tracing::error!(error = %e, "Delivery pipeline failed, shutting down");
                server.abort();
                return Err(e).context("Delivery pipeline stopped with an error");
            }
            server
                .await
                .context("HTTP server task failed")?
                .context("Server error")?;
        }
    }

    tracing::info!("courier-server stopped");
    Ok(())
}
