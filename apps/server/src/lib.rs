//! # Roomsign Server
//!
//! HTTP surface of the sync core.
//!
//! | Route                                 | Purpose                          |
//! |---------------------------------------|----------------------------------|
//! | `GET  /api/displays/{id}/stream`      | SSE push stream for a kiosk      |
//! | `POST /api/cron/sync`                 | One dispatch cycle (Bearer auth) |
//! | `POST /api/displays/{id}/config`      | Store + push display config      |
//! | `GET  /api/health/sync`               | Registry and calendar sync state |
//! | `GET  /health`                        | Liveness                         |

pub mod error;
pub mod handlers;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use roomsign_db::Database;
use roomsign_sync::{ConnectionRegistry, DispatchJob};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<dyn DispatchJob>,
    pub cron_secret: Option<Arc<str>>,
    /// Frames buffered per SSE connection before it counts as dead.
    pub sink_buffer: usize,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/health/sync", get(handlers::sync_health))
        .route("/api/cron/sync", post(handlers::trigger_sync))
        .route("/api/displays/{display_id}/stream", get(handlers::stream_display))
        .route("/api/displays/{display_id}/config", post(handlers::update_config))
        .with_state(state)
}
