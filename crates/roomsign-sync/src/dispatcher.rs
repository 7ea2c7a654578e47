//! # Sync Dispatcher
//!
//! One dispatch cycle: recover abandoned locks, pick due calendars, run them
//! concurrently.
//!
//! ## Flow
//! ```text
//! dispatch()
//!   │
//!   ├─► 1. recover_stale(now - stale_after)   one bulk conditional UPDATE
//!   │        SYNCING + old updated_at ─► ERROR, "Sync timed out", next_sync_at = now
//!   │
//!   ├─► 2. select_due(now, batch_size)        enabled, not SYNCING, due
//!   │        empty ─► return (debug only)
//!   │
//!   ├─► 3. join_all(runner.run(id) for each)  every job runs to completion
//!   │
//!   └─► 4. tally outcomes, warn per failure   never re-raised
//! ```
//!
//! Only steps 1 and 2 can fail the call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use roomsign_core::STALE_SYNC_ERROR;
use roomsign_db::Database;

use crate::config::DispatcherSettings;
use crate::error::SyncResult;
use crate::provider::ProviderRegistry;
use crate::runner::{SyncOutcome, SyncRunner, UpdateNotifier};

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Abandoned locks forced to `ERROR`.
    pub recovered: u64,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Lock taken by someone else between selection and acquire.
    pub skipped: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &SyncResult<SyncOutcome>) {
        match outcome {
            Ok(SyncOutcome::Synced { .. }) => self.succeeded += 1,
            Ok(SyncOutcome::Skipped) => self.skipped += 1,
            Ok(SyncOutcome::Failed { .. }) | Err(_) => self.failed += 1,
        }
    }
}

/// Something that runs dispatch cycles.
#[async_trait]
pub trait DispatchJob: Send + Sync {
    async fn dispatch(&self) -> SyncResult<DispatchReport>;
}

/// Runs dispatch cycles against the calendar table.
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    runner: SyncRunner,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(db: Database, runner: SyncRunner, settings: DispatcherSettings) -> Self {
        Dispatcher { db, runner, settings }
    }

    /// Builds the runner from its parts.
    pub fn with_providers(
        db: Database,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<dyn UpdateNotifier>,
        settings: DispatcherSettings,
    ) -> Self {
        let runner = SyncRunner::new(db.clone(), providers, notifier);
        Self::new(db, runner, settings)
    }

    /// Runs one cycle.
    ///
    /// ## Returns
    /// * `Ok(report)` - per-calendar failures are counted, not raised
    /// * `Err(_)` - the recovery update or the selection query failed
    pub async fn dispatch(&self) -> SyncResult<DispatchReport> {
        let calendars = self.db.calendars();
        let now = Utc::now();
        let mut report = DispatchReport::default();

        report.recovered = calendars
            .recover_stale(now - self.settings.stale_after(), now, STALE_SYNC_ERROR)
            .await?;
        if report.recovered > 0 {
            warn!(recovered = report.recovered, "Recovered stale sync locks");
        }

        let limit = u32::try_from(self.settings.batch_size).unwrap_or(u32::MAX);
        let due = calendars.select_due(now, limit).await?;
        report.selected = due.len();

        if due.is_empty() {
            debug!("No calendars due");
            return Ok(report);
        }

        let outcomes = join_all(due.iter().map(|calendar| self.runner.run(&calendar.id))).await;

        for (calendar, outcome) in due.iter().zip(&outcomes) {
            report.record(outcome);
            match outcome {
                Ok(SyncOutcome::Failed { message }) => {
                    warn!(calendar_id = %calendar.id, name = %calendar.name, error = %message, "Calendar sync failed");
                }
                Err(e) => {
                    warn!(calendar_id = %calendar.id, name = %calendar.name, error = %e, "Calendar sync aborted");
                }
                Ok(_) => {}
            }
        }

        info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Dispatch cycle complete"
        );

        Ok(report)
    }
}

#[async_trait]
impl DispatchJob for Dispatcher {
    async fn dispatch(&self) -> SyncResult<DispatchReport> {
        Dispatcher::dispatch(self).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
