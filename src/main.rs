use std::sync::Arc;

use grocery_dispatch::api;
use grocery_dispatch::config::Config;
use grocery_dispatch::engine::sweeper::run_sweeper;
use grocery_dispatch::error::AppError;
use grocery_dispatch::external::{LoggingChannelSender, run_channel_worker};
use grocery_dispatch::state::AppState;
use tokio::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let (app_state, outbound_rx) = AppState::new(
        config.delivery.clone(),
        config.outbound_queue_size,
        config.event_buffer_size,
    );
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_channel_worker(
        Arc::new(LoggingChannelSender),
        shared_state.metrics.clone(),
        outbound_rx,
    ));
    tokio::spawn(run_sweeper(
        shared_state.clone(),
        Duration::from_millis(config.sweep_interval_ms),
    ));

    let app = api::rest::router(shared_state).layer(CorsLayer::permissive());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        store_lat = config.delivery.matching.origin.lat,
        store_lng = config.delivery.matching.origin.lng,
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
