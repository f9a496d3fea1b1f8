use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use telemetry_ingestor::config::Config;
use telemetry_ingestor::db::PgStore;
use telemetry_ingestor::pipeline::Pipeline;
use telemetry_ingestor::{metrics, mqtt, rest};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting telemetry ingestor");
    info!("MQTT broker: {}:{} ({})", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    metrics::init_metrics().context("failed to register metrics")?;

    // The pool connects lazily: a store outage at startup only means buffering.
    let store = PgStore::connect_lazy(&config.database_url, config.pipeline.write_timeout)
        .context("invalid database configuration")?;

    let pipeline = Pipeline::new(&config.pipeline, Arc::new(store))
        .context("failed to open offline queue")?;
    let mut pipeline_tasks = pipeline.start();

    let client_id = format!("ingestor-{}", uuid::Uuid::new_v4());
    let mqtt_gateway = pipeline.gateway();
    let (broker, port, topic) = (
        config.mqtt_broker.clone(),
        config.mqtt_port,
        config.mqtt_topic.clone(),
    );
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(broker, port, client_id, topic, mqtt_gateway).await {
            error!("MQTT task failed: {}", e);
        }
    });

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pipeline.gateway(), pipeline.stats()));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = pipeline_tasks.join_next() => {
            error!("Pipeline task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Flushing buffered telemetry before shutdown");
    pipeline.flush().await;
    let stats = pipeline.stats().snapshot();
    if stats.offline_queue_size > 0 {
        info!(
            "Shutting down with {} records in the offline queue",
            stats.offline_queue_size
        );
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
