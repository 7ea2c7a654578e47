//! # roomsign-sync: Calendar Sync Engine and Live Push
//!
//! Keeps room calendars in step with their external providers and pushes
//! changes to connected kiosk displays.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │   cron endpoint ──┐                                                     │
//! │                   ├──► Dispatcher::dispatch()                           │
//! │   WorkerLoop ─────┘       │                                             │
//! │   (every 30s)             │ 1. recover stale SYNCING locks              │
//! │                           │ 2. select ≤ 10 due calendars                │
//! │                           │ 3. join_all(SyncRunner::run)                │
//! │                           ▼                                             │
//! │                     ┌────────────┐   ProviderRegistry                   │
//! │                     │ SyncRunner │──► CalendarProvider::sync            │
//! │                     └─────┬──────┘                                      │
//! │                           │ events changed                              │
//! │                           ▼                                             │
//! │                  UpdateNotifier ──► ConnectionRegistry ──► PushSink     │
//! │                                        ▲      (SSE in roomsign-server)  │
//! │   ChangeRelay (polls calendar_changes) ┘                                │
//! │                                                                         │
//! │  The SYNCING status on the calendar row is the only lock. It is taken   │
//! │  and released with conditional UPDATEs, so the server, the standalone   │
//! │  worker and the cron path can all dispatch at once.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//! - [`config`]: Layered TOML + environment configuration
//! - [`dispatcher`]: Stale-lock recovery, selection, concurrent execution
//! - [`runner`]: Single-calendar sync under the row lock
//! - [`provider`]: Calendar provider capability and registry
//! - [`registry`]: Push subscriptions, fan-out, heartbeat
//! - [`relay`]: Cross-process change relay
//! - [`worker`]: Periodic dispatch loop
//! - [`error`]: Error types

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::RoomsignConfig;
pub use dispatcher::{DispatchJob, DispatchReport, Dispatcher};
pub use error::{ProviderError, SyncError, SyncResult};
pub use provider::{CalendarProvider, ProviderRegistry, ProviderSyncResult};
pub use registry::{
    ConnectionRegistry, HeartbeatHandle, PushFrame, PushSink, RegistryStatus, SinkClosed, Subscription,
    SubscriptionInfo,
};
pub use relay::{ChangeRelay, RelayHandle};
pub use runner::{NoOpNotifier, SyncOutcome, SyncRunner, UpdateNotifier};
pub use worker::{WorkerLoop, WorkerLoopHandle};
