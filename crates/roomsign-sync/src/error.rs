//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Infrastructure  │  │  Per-calendar           │ │
//! │  │                 │  │                 │  │  (ProviderError)        │ │
//! │  │  InvalidConfig  │  │  DatabaseError  │  │                         │ │
//! │  │  ConfigLoad...  │  │  Serialization  │  │  Auth / Network         │ │
//! │  │                 │  │  ChannelError   │  │  InvalidResponse        │ │
//! │  │                 │  │                 │  │  Unsupported            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  SyncError crosses component boundaries (dispatch() fails, the        │
//! │  caller retries next tick). ProviderError never does: the runner      │
//! │  records it as lastSyncError on the calendar row.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors the caller of a sync-engine operation can act on.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read or parse the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to serialize a push message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<roomsign_db::DbError> for SyncError {
    fn from(err: roomsign_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl SyncError {
    /// Returns true if a later attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::DatabaseError(_) | SyncError::ChannelError(_))
    }
}

// =============================================================================
// Provider Errors
// =============================================================================

/// Failure of one calendar's provider call.
///
/// The `Display` text is stored verbatim as the calendar's `last_sync_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials rejected or expired.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider unreachable, timed out, or returned a server error.
    #[error("Network error: {0}")]
    Network(String),

    /// Provider answered with something that could not be interpreted.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No implementation can sync this calendar.
    #[error("{0}")]
    Unsupported(String),
}

impl From<roomsign_core::CoreError> for ProviderError {
    fn from(err: roomsign_core::CoreError) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}
