//! # Change Relay
//!
//! Bridges syncs run by another process (the standalone worker) to this
//! process's [`ConnectionRegistry`].
//!
//! ```text
//! worker process                 server process
//! ──────────────                 ──────────────
//! SyncRunner                     ChangeRelay (every 5s)
//!   └─ calendar_changes(seq) ──►   changes_after(watermark)
//!                                    └─ load events ─► registry.notify_calendar_update
//!                                  watermark = last seq relayed
//! ```
//!
//! `seq` is assigned inside the committing transaction, so a change that
//! commits after the watermark always has a higher `seq`, whatever its
//! wall-clock timestamp.
//!
//! Pushes already sent by an in-process runner may be repeated; kiosks
//! replace their event list on every `calendar_update`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use roomsign_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::registry::ConnectionRegistry;

/// Polls the calendar change log and pushes changed calendars.
pub struct ChangeRelay {
    db: Database,
    registry: Arc<ConnectionRegistry>,
    watermark: i64,
}

impl ChangeRelay {
    /// Relays changes with a sequence above `after_seq`.
    pub fn new(db: Database, registry: Arc<ConnectionRegistry>, after_seq: i64) -> Self {
        ChangeRelay {
            db,
            registry,
            watermark: after_seq,
        }
    }

    /// Starts past every change already committed.
    pub async fn from_latest(db: Database, registry: Arc<ConnectionRegistry>) -> SyncResult<Self> {
        let after_seq = db.calendars().latest_change_seq().await?;
        Ok(Self::new(db, registry, after_seq))
    }

    /// Last change sequence handled.
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    /// One poll.
    ///
    /// ## Returns
    /// Number of calendars relayed. Zero when nobody is connected, though the
    /// watermark still moves past the changes seen.
    pub async fn poll_once(&mut self) -> SyncResult<usize> {
        let changes = self.db.calendars().changes_after(self.watermark).await?;
        let Some(newest) = changes.last().map(|c| c.seq) else {
            return Ok(0);
        };

        if self.registry.active_count() == 0 {
            debug!(changes = changes.len(), "No connections, skipping relay");
            self.watermark = newest;
            return Ok(0);
        }

        let events = self.db.events();
        let mut relayed = HashSet::new();
        for change in &changes {
            // Current events are loaded, so one push covers repeated entries.
            if !relayed.contains(&change.calendar_id) {
                let calendar_events = events.list_for_calendar(&change.calendar_id).await?;
                let delivered = self
                    .registry
                    .notify_calendar_update(&change.calendar_id, &calendar_events);
                debug!(calendar_id = %change.calendar_id, seq = change.seq, delivered, "Relayed calendar change");
                relayed.insert(change.calendar_id.clone());
            }
            // Advance per entry so a failed load retries only what is left.
            self.watermark = change.seq;
        }

        Ok(relayed.len())
    }

    /// Spawns the polling task.
    pub fn start(mut self, period: Duration) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            info!(poll_secs = period.as_secs(), after_seq = self.watermark, "Change relay started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.poll_once().await {
                            Ok(0) => {}
                            Ok(relayed) => info!(relayed, "Relayed calendar changes"),
                            Err(e) => error!(?e, "Change relay poll failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Change relay stopping");
                        break;
                    }
                }
            }
        });

        RelayHandle { shutdown_tx, task }
    }
}

/// Controls the relay task.
pub struct RelayHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayHandle {
    pub async fn shutdown(self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Relay shutdown channel closed".into()))?;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("Relay task failed: {e}")))
    }
}
