//! # Roomsign Configuration
//!
//! One config shared by the server and the worker binaries.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     ROOMSIGN_DATABASE_PATH=/var/lib/roomsign/roomsign.db               │
//! │     ROOMSIGN_CRON_SECRET=...                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     $ROOMSIGN_CONFIG, else ./config/roomsign.toml                      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "data/roomsign.db"
//! max_connections = 5
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 3000
//! cron_secret = "change-me"
//!
//! [dispatcher]
//! batch_size = 10
//! stale_after_secs = 300
//!
//! [worker]
//! interval_secs = 30
//!
//! [registry]
//! heartbeat_interval_secs = 30
//! sink_buffer = 32
//!
//! [relay]
//! enabled = true
//! poll_interval_secs = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use roomsign_core::{
    DEFAULT_DISPATCH_BATCH_SIZE, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_STALE_LOCK_SECS,
    DEFAULT_WORKER_INTERVAL_SECS,
};
use roomsign_db::DbConfig;

use crate::error::{SyncError, SyncResult};

/// Config file used when `ROOMSIGN_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/roomsign.toml";

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file shared by server and worker.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/roomsign.db")
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    /// Pool configuration for these settings.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.path).max_connections(self.max_connections)
    }
}

// =============================================================================
// Server Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer secret for the cron and config endpoints.
    /// Unset means those endpoints reject every request.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            cron_secret: None,
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Dispatcher / Worker / Registry / Relay Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Calendars synced per dispatch cycle at most.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Age of `updated_at` after which a `SYNCING` lock counts as abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: i64,
}

fn default_batch_size() -> usize {
    DEFAULT_DISPATCH_BATCH_SIZE
}

fn default_stale_after() -> i64 {
    DEFAULT_STALE_LOCK_SECS
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            batch_size: default_batch_size(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl DispatcherSettings {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_interval")]
    pub interval_secs: u64,
}

fn default_worker_interval() -> u64 {
    DEFAULT_WORKER_INTERVAL_SECS
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            interval_secs: default_worker_interval(),
        }
    }
}

impl WorkerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Frames buffered per SSE connection before it counts as dead.
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_sink_buffer() -> usize {
    32
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            heartbeat_interval_secs: default_heartbeat_interval(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

impl RegistrySettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_relay_poll")]
    pub poll_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_relay_poll() -> u64 {
    5
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            enabled: true,
            poll_interval_secs: default_relay_poll(),
        }
    }
}

impl RelaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomsignConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub relay: RelaySettings,
}

impl RoomsignConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`config_path`, `$ROOMSIGN_CONFIG`, or `config/roomsign.toml`)
    /// 3. Environment variables
    ///
    /// A missing file is not an error; an unreadable or malformed one is.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = config_path
            .or_else(|| std::env::var_os("ROOMSIGN_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Reads a config file, falling back to defaults when it does not exist.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(?path, "Loading config from file");
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig("database.path must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatcher.batch_size must be greater than 0".into(),
            ));
        }
        if self.dispatcher.stale_after_secs <= 0 {
            return Err(SyncError::InvalidConfig(
                "dispatcher.stale_after_secs must be greater than 0".into(),
            ));
        }
        if self.worker.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "worker.interval_secs must be greater than 0".into(),
            ));
        }
        if self.registry.heartbeat_interval_secs == 0 || self.registry.sink_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "registry.heartbeat_interval_secs and registry.sink_buffer must be greater than 0"
                    .into(),
            ));
        }
        if self.relay.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "relay.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if matches!(self.server.cron_secret.as_deref(), Some(s) if s.trim().is_empty()) {
            return Err(SyncError::InvalidConfig(
                "server.cron_secret must not be blank".into(),
            ));
        }

        Ok(())
    }

    /// Applies `ROOMSIGN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable source.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("ROOMSIGN_DATABASE_URL") {
            let path = url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            debug!(path = %path, "Overriding database path from ROOMSIGN_DATABASE_URL");
            self.database.path = PathBuf::from(path);
        }

        if let Some(path) = var("ROOMSIGN_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(port) = var("ROOMSIGN_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!(value = %port, "Ignoring invalid ROOMSIGN_PORT"),
            }
        }

        if let Some(secret) = var("ROOMSIGN_CRON_SECRET") {
            self.server.cron_secret = Some(secret);
        }

        if let Some(secs) = var("ROOMSIGN_WORKER_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.worker.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid ROOMSIGN_WORKER_INTERVAL_SECS"),
            }
        }

        if let Some(size) = var("ROOMSIGN_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(s) => self.dispatcher.batch_size = s,
                Err(_) => warn!(value = %size, "Ignoring invalid ROOMSIGN_BATCH_SIZE"),
            }
        }
    }
}
