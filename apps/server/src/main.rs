//! # Roomsign Server
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Roomsign Server                                │
//! │                                                                         │
//! │  kiosk ◄── SSE ── axum ──► Dispatcher (cron trigger)                   │
//! │                     │                                                   │
//! │                     ▼                                                   │
//! │             ConnectionRegistry ◄── heartbeat task (30s)                │
//! │                     ▲                                                   │
//! │                     └──────── ChangeRelay ◄── SQLite (worker writes)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roomsign_db::Database;
use roomsign_server::{router, AppState};
use roomsign_sync::{ChangeRelay, ConnectionRegistry, Dispatcher, ProviderRegistry, RoomsignConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting Roomsign server...");

    let config = RoomsignConfig::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load configuration")?;

    let db = Database::new(config.database.db_config())
        .await
        .context("Failed to open database")?;
    let (total, applied) = db.migration_status().await?;
    info!(total, applied, "Database ready");

    let registry = Arc::new(ConnectionRegistry::new());
    let heartbeat = registry.start_heartbeat(config.registry.heartbeat_interval());

    let relay = if config.relay.enabled {
        let relay = ChangeRelay::from_latest(db.clone(), registry.clone())
            .await
            .context("Failed to read change log")?;
        Some(relay.start(config.relay.poll_interval()))
    } else {
        None
    };

    // Provider integrations register here; unregistered kinds fail their sync.
    let providers = Arc::new(ProviderRegistry::new());
    let dispatcher = Dispatcher::with_providers(
        db.clone(),
        providers,
        registry.clone(),
        config.dispatcher.clone(),
    );

    if config.server.cron_secret.is_none() {
        warn!("No cron secret configured; cron and config endpoints reject all requests");
    }

    let state = AppState {
        db: db.clone(),
        registry,
        dispatcher: Arc::new(dispatcher),
        cron_secret: config.server.cron_secret.as_deref().map(Arc::from),
        sink_buffer: config.registry.sink_buffer,
    };

    let addr = config.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    heartbeat.shutdown().await?;
    if let Some(relay) = relay {
        relay.shutdown().await?;
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
