//! # Connection Registry
//!
//! Live push subscriptions of kiosk displays, and the fan-out of updates to
//! them.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Connection Registry                                 │
//! │                                                                         │
//! │  SSE handler ──register──►  ┌──────────────────────────────────────┐   │
//! │  drop guard ─unregister──►  │ RwLock<HashMap<id, Subscription>>    │   │
//! │                             │                                      │   │
//! │  SyncRunner ──notify_calendar_update(cal, events)                  │   │
//! │  ChangeRelay ─┘             │   1. read lock: snapshot matching    │   │
//! │  config API ──notify_display_config_update(display, cfg)           │   │
//! │                             │   2. no lock: write_frame per sink   │   │
//! │  heartbeat task (30s) ────► │   3. write lock: drop failed ids     │   │
//! │                             └──────────────────────────────────────┘   │
//! │                                                                         │
//! │  One failing sink never affects the others: every write is caught      │
//! │  locally and only that subscription is removed.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The map lock is a `std::sync::RwLock` held only for short map operations,
//! never across a sink write, so it can also be taken from `Drop`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use roomsign_core::{CalendarEvent, PushMessage};

use crate::error::{SyncError, SyncResult};
use crate::runner::UpdateNotifier;

// =============================================================================
// Sink Capability
// =============================================================================

/// One frame on a push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    /// A serialized [`PushMessage`].
    Message(String),
    /// Empty comment frame that keeps intermediaries from closing the stream.
    KeepAlive,
}

impl PushFrame {
    pub fn message(msg: &PushMessage) -> SyncResult<Self> {
        Ok(PushFrame::Message(msg.to_json()?))
    }
}

/// The connection can no longer accept frames.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("push sink closed")]
pub struct SinkClosed;

/// Outbound side of a push connection.
///
/// Writes must not block; a sink that cannot take a frame right now reports
/// [`SinkClosed`].
pub trait PushSink: Send + Sync {
    fn write_frame(&self, frame: &PushFrame) -> Result<(), SinkClosed>;
}

// =============================================================================
// Subscription
// =============================================================================

/// A live push connection of one display.
pub struct Subscription {
    pub id: String,
    pub display_id: String,
    /// Room calendar first, then attached calendars.
    pub calendar_ids: Vec<String>,
    pub sink: Arc<dyn PushSink>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Subscription {
    /// Creates a subscription with a fresh id.
    pub fn new(display_id: impl Into<String>, calendar_ids: Vec<String>, sink: Arc<dyn PushSink>) -> Self {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4().to_string(),
            display_id: display_id.into(),
            calendar_ids,
            sink,
            connected_at: now,
            last_heartbeat: now,
        }
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            display_id: self.display_id.clone(),
            calendar_ids: self.calendar_ids.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Diagnostic view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub display_id: String,
    pub calendar_ids: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Registry snapshot for the health view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub total_connections: usize,
    pub display_count: usize,
    pub connections: Vec<SubscriptionInfo>,
}

/// Result of one heartbeat pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub delivered: usize,
    pub reaped: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide set of push subscriptions. Share it through an `Arc`.
#[derive(Default)]
pub struct ConnectionRegistry {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a subscription. Returns its id.
    pub fn register(&self, subscription: Subscription) -> String {
        let id = subscription.id.clone();
        info!(
            subscription_id = %id,
            display_id = %subscription.display_id,
            calendars = subscription.calendar_ids.len(),
            "Display connected"
        );
        self.write().insert(id.clone(), subscription);
        id
    }

    /// Removes a subscription. Unknown ids are ignored.
    ///
    /// ## Returns
    /// Whether a subscription was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        if let Some(sub) = &removed {
            info!(subscription_id = %id, display_id = %sub.display_id, "Display disconnected");
        }
        removed.is_some()
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    pub fn clients_by_calendar_id(&self, calendar_id: &str) -> Vec<SubscriptionInfo> {
        self.read()
            .values()
            .filter(|sub| sub.calendar_ids.iter().any(|id| id == calendar_id))
            .map(Subscription::info)
            .collect()
    }

    pub fn clients_by_display_id(&self, display_id: &str) -> Vec<SubscriptionInfo> {
        self.read()
            .values()
            .filter(|sub| sub.display_id == display_id)
            .map(Subscription::info)
            .collect()
    }

    /// Pushes `calendar_update` to every subscription showing `calendar_id`.
    ///
    /// ## Returns
    /// Number of subscriptions the frame was delivered to.
    pub fn notify_calendar_update(&self, calendar_id: &str, events: &[CalendarEvent]) -> usize {
        let msg = PushMessage::calendar_update(calendar_id, events.to_vec());
        self.broadcast(&msg, |sub| sub.calendar_ids.iter().any(|id| id == calendar_id))
    }

    /// Pushes `config_update` to every subscription of `display_id`.
    pub fn notify_display_config_update(&self, display_id: &str, config: &serde_json::Value) -> usize {
        let msg = PushMessage::config_update(config.clone());
        self.broadcast(&msg, |sub| sub.display_id == display_id)
    }

    fn broadcast(&self, msg: &PushMessage, matches: impl Fn(&Subscription) -> bool) -> usize {
        let frame = match PushFrame::message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = msg.kind(), ?e, "Failed to serialize push message");
                return 0;
            }
        };

        let targets: Vec<(String, Arc<dyn PushSink>)> = self
            .read()
            .values()
            .filter(|sub| matches(sub))
            .map(|sub| (sub.id.clone(), sub.sink.clone()))
            .collect();

        let (delivered, failed) = deliver(&targets, &frame);
        self.reap(&failed);

        debug!(kind = msg.kind(), delivered = delivered.len(), reaped = failed.len(), "Push fan-out");
        delivered.len()
    }

    /// Writes a keep-alive to every subscription.
    ///
    /// Failed subscriptions are removed; the others get `last_heartbeat`
    /// refreshed.
    pub fn heartbeat(&self) -> HeartbeatReport {
        let targets: Vec<(String, Arc<dyn PushSink>)> = self
            .read()
            .values()
            .map(|sub| (sub.id.clone(), sub.sink.clone()))
            .collect();

        let (delivered, failed) = deliver(&targets, &PushFrame::KeepAlive);
        self.reap(&failed);

        if !delivered.is_empty() {
            let now = Utc::now();
            let mut subscriptions = self.write();
            for id in &delivered {
                if let Some(sub) = subscriptions.get_mut(id) {
                    sub.last_heartbeat = now;
                }
            }
        }

        HeartbeatReport {
            delivered: delivered.len(),
            reaped: failed.len(),
        }
    }

    fn reap(&self, failed: &[String]) {
        if failed.is_empty() {
            return;
        }
        let mut subscriptions = self.write();
        for id in failed {
            if let Some(sub) = subscriptions.remove(id) {
                info!(subscription_id = %id, display_id = %sub.display_id, "Reaped dead connection");
            }
        }
    }

    /// Connection counts and per-connection summary.
    pub fn status(&self) -> RegistryStatus {
        let subscriptions = self.read();
        let mut connections: Vec<SubscriptionInfo> = subscriptions.values().map(Subscription::info).collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));

        let display_count = subscriptions
            .values()
            .map(|sub| sub.display_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        RegistryStatus {
            total_connections: subscriptions.len(),
            display_count,
            connections,
        }
    }

    /// Spawns the periodic heartbeat task.
    pub fn start_heartbeat(self: &Arc<Self>, period: Duration) -> HeartbeatHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let registry = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; connections are brand new.
            ticker.tick().await;

            info!(interval_secs = period.as_secs(), "Heartbeat started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = registry.heartbeat();
                        if report.reaped > 0 {
                            info!(reaped = report.reaped, alive = report.delivered, "Heartbeat reaped connections");
                        } else {
                            debug!(alive = report.delivered, "Heartbeat sent");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat stopping");
                        break;
                    }
                }
            }
        });

        HeartbeatHandle { shutdown_tx, task }
    }
}

impl UpdateNotifier for ConnectionRegistry {
    fn notify_calendar_update(&self, calendar_id: &str, events: &[CalendarEvent]) {
        ConnectionRegistry::notify_calendar_update(self, calendar_id, events);
    }
}

/// Writes `frame` to each sink; splits ids into delivered and failed.
fn deliver(targets: &[(String, Arc<dyn PushSink>)], frame: &PushFrame) -> (Vec<String>, Vec<String>) {
    let mut delivered = Vec::with_capacity(targets.len());
    let mut failed = Vec::new();
    for (id, sink) in targets {
        match sink.write_frame(frame) {
            Ok(()) => delivered.push(id.clone()),
            Err(SinkClosed) => {
                debug!(subscription_id = %id, "Push delivery failed");
                failed.push(id.clone());
            }
        }
    }
    (delivered, failed)
}

// =============================================================================
// Heartbeat Handle
// =============================================================================

/// Controls the heartbeat task.
pub struct HeartbeatHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops the task and waits for it to exit.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Heartbeat shutdown channel closed".into()))?;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("Heartbeat task failed: {e}")))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
