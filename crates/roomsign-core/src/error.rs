//! # Error Types
//!
//! Domain-specific error types for roomsign-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  roomsign-core errors (this file)                                      │
//! │  └── CoreError        - Domain parsing and validation failures         │
//! │                                                                         │
//! │  roomsign-db errors (separate crate)                                   │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  roomsign-sync errors (separate crate)                                 │
//! │  ├── SyncError        - Dispatcher / registry / config failures        │
//! │  └── ProviderError    - Per-calendar provider failures                 │
//! │                                                                         │
//! │  Flow: CoreError → ProviderError → lastSyncError on the calendar row   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Domain errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A stored sync status string is not one of IDLE / SYNCING / ERROR.
    #[error("Unknown sync status: '{0}'")]
    UnknownSyncStatus(String),

    /// A stored provider string does not name a supported provider.
    #[error("Unknown calendar provider: '{0}'")]
    UnknownProvider(String),

    /// A fetched event failed validation.
    ///
    /// ## When This Occurs
    /// - Provider returned an event without an external id
    /// - Event ends before it starts
    #[error("Invalid event '{external_id}': {reason}")]
    InvalidEvent { external_id: String, reason: String },
}

impl CoreError {
    /// Creates an InvalidEvent error.
    pub fn invalid_event(external_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidEvent {
            external_id: external_id.into(),
            reason: reason.into(),
        }
    }
}
