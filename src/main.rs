//! Wisp Backend - zero-knowledge ephemeral messaging server
//!
//! Stores ciphertext blobs, routing metadata, and delivery state for
//! time-limited two-party conversations. Message ingestion runs through a
//! buffered pipeline drained by a background worker; delivery fans out over
//! a WebSocket push channel and APNS for offline devices.
//!
//! # Security Properties
//!
//! - No plaintext content ever touches the server
//! - Devices are opaque identifiers; there are no user accounts
//! - Conversations and messages expire and are swept automatically
//! - The vendor push channel only ever sees a hashed conversation id

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use wisp_backend::config::Config;
use wisp_backend::handlers::{build_router, AppState};
use wisp_backend::sweeper::Sweeper;
use wisp_backend::worker::PipelineWorker;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Initialize structured logging
    init_tracing();

    // Load and validate configuration
    let config = Config::from_env();
    log_startup_info(&config);

    let state = AppState::new(config.clone()).await;

    // Background workers: pipeline drain and lifecycle sweep.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Arc::new(PipelineWorker::new(
        state.store.clone(),
        state.cache.clone(),
        state.queue.clone(),
        state.hub.clone(),
        state.apns.clone(),
        state.config.clone(),
        shutdown_rx,
    ));
    let worker_handle = worker.start();

    let sweeper = Arc::new(Sweeper::new(
        state.store.clone(),
        state.cache.clone(),
        state.apns.clone(),
        state.files.clone(),
        state.queue.clone(),
        state.config.clone(),
    ));
    sweeper.start();

    // Build and serve the application
    let app = build_router(state);
    serve(app, &config).await;

    // Graceful shutdown: stop popping, let the in-flight record finish.
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    info!("Shutdown complete");
}

/// Initialize tracing with environment-based log levels.
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wisp_backend=debug,tower_http=info")),
        )
        .init();
}

/// Log startup configuration (no secrets).
fn log_startup_info(config: &Config) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        queue_interval_ms = config.queue_interval.as_millis() as u64,
        queue_batch = config.queue_batch_size,
        sweeper_interval_secs = config.sweeper_interval.as_secs(),
        apns_enabled = config.apns_configured(),
        "Starting Wisp backend"
    );
}

/// Bind to address and serve the application until ctrl-c.
async fn serve(app: axum::Router, config: &Config) {
    let bind_addr = format!("{}:{}", config.bind_addr, config.port);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
