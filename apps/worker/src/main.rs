//! # Roomsign Worker
//!
//! Standalone sync loop: one dispatch on startup, then every
//! `worker.interval_secs`. Runs alongside the server; the calendar row lock
//! keeps concurrent dispatchers from syncing the same calendar twice.
//!
//! Pushes reach displays through the server's change relay, so this
//! process notifies nobody directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use roomsign_db::Database;
use roomsign_sync::{Dispatcher, NoOpNotifier, ProviderRegistry, RoomsignConfig, WorkerLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting Roomsign sync worker...");

    let config = RoomsignConfig::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load configuration")?;

    let db = Database::new(config.database.db_config())
        .await
        .context("Failed to open database")?;

    let dispatcher = Dispatcher::with_providers(
        db.clone(),
        Arc::new(ProviderRegistry::new()),
        Arc::new(NoOpNotifier),
        config.dispatcher.clone(),
    );

    let (worker, handle) = WorkerLoop::new(Arc::new(dispatcher), config.worker.interval());
    let task = tokio::spawn(worker.run());

    shutdown_signal().await;
    handle.shutdown().await?;
    task.await.context("Worker task panicked")?;

    db.close().await;
    info!("Worker shutdown complete");
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

    info!("Shutdown signal received");
}
