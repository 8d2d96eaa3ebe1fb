//! `orders-api`: service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (JSON logs, optional OTLP).
//! 3. Build the configured idempotency record store.
//! 4. Spawn the expired-record prune task.
//! 5. Build the Axum router and start the HTTP server.

mod config;
mod error;
mod idempotency;
mod orders;
mod server;
mod telemetry;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use config::Config;
use idempotency::IdempotencyCoordinator;
use orders::OrderBook;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.listen_port,
        idempotency_backend = %cfg.idempotency_backend,
        "orders-api starting"
    );

    // -----------------------------------------------------------------------
    // 3. Idempotency store
    // -----------------------------------------------------------------------
    let store = idempotency::store::build(
        cfg.idempotency_backend,
        cfg.idempotency_sqlite_path.as_deref(),
    )
    .context("failed to initialise idempotency store")?;
    if store.backend() == idempotency::StoreBackend::Memory {
        warn!("memory idempotency store is per-process; run a single instance or use sqlite");
    }

    // -----------------------------------------------------------------------
    // 4. Background tasks
    // -----------------------------------------------------------------------
    let _prune = idempotency::prune_task(
        store.clone(),
        Duration::from_secs(cfg.idempotency_prune_interval_secs),
    );

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let coordinator = IdempotencyCoordinator::new(store, cfg.idempotency_policy());
    let state = AppState::new(coordinator, OrderBook::new());
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
