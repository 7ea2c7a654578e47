//! # roomsign-core: Domain Model for Roomsign
//!
//! Pure types shared by the database layer, the sync engine and the HTTP host.
//! Nothing in here performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Roomsign Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Kiosk display pages (browser)                   │   │
//! │  │        EventSource ──► init / calendar_update / config_update   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ SSE                                    │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          roomsign-server / roomsign-worker (apps)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   roomsign-sync: dispatcher, runner, registry, worker loop      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ roomsign-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   push    │  │  backoff  │  │   error   │  │   │
//! │  │   │ Calendar  │  │PushMessage│  │ retry and │  │ CoreError │  │   │
//! │  │   │ Event     │  │ envelopes │  │ interval  │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Calendars, events, displays and the sync status lock
//! - [`push`] - Wire envelopes pushed to kiosk displays
//! - [`backoff`] - Next-sync scheduling after success and failure
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod error;
pub mod push;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::CoreError;
pub use push::{CalendarUpdatePayload, ConfigUpdatePayload, InitPayload, PushMessage};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of calendars a single dispatch cycle will sync.
///
/// Bounds burst load on providers and the database; the rest are picked up
/// on the next tick.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 10;

/// A `SYNCING` lock older than this (by `updated_at`) is considered abandoned.
pub const DEFAULT_STALE_LOCK_SECS: i64 = 5 * 60;

/// Error text recorded on calendars recovered from an abandoned lock.
pub const STALE_SYNC_ERROR: &str = "Sync timed out";

/// Cadence of the standalone worker loop.
pub const DEFAULT_WORKER_INTERVAL_SECS: u64 = 30;

/// Cadence of push keep-alive frames.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
