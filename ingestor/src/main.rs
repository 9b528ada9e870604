mod broker;
mod config;
mod db;
mod errors;
mod ingest;
mod metrics;
mod model;
mod rest;
mod snapshot;
mod store;
mod validate;
mod ws;

use axum::{routing::get, Router};
use broker::Broker;
use clap::Parser;
use config::{Config, StoreKind};
use ingest::Gateway;
use std::sync::Arc;
use store::{InMemoryTelemetryStore, TelemetryStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting farm telemetry ingestor");
    info!("HTTP server: {}", config.http_addr);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let store: Arc<dyn TelemetryStore> = match config.store {
        StoreKind::Postgres => {
            info!("Database: {}", config.database_display());
            match db::make_pool(&config.database_url, config.db_max_connections).await {
                Ok(pool) => Arc::new(db::PgTelemetryStore::new(pool)),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreKind::Memory => {
            info!("Using in-memory telemetry store");
            Arc::new(InMemoryTelemetryStore::new())
        }
    };

    info!("Subscriber queue capacity: {}", config.subscriber_queue);
    let broker = Arc::new(Broker::new(config.subscriber_queue as usize));
    let gateway = Gateway::new(store, Arc::clone(&broker), config.persist_actuator_events);

    // Build HTTP app with ingestion, subscription and metrics endpoints
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .merge(rest::create_router(gateway));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let shutdown_broker = Arc::clone(&broker);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!(groups = shutdown_broker.group_count(), "Received shutdown signal");
        // Ends every open subscription so the server can drain
        shutdown_broker.close();
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics().unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}

async fn health_handler() -> &'static str {
    "OK"
}
