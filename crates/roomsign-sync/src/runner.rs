//! # Sync Runner
//!
//! Syncs exactly one calendar under the row lock.
//!
//! ## Run Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncRunner::run(id)                             │
//! │                                                                         │
//! │  try_acquire(id, token) ──── 0 rows ───► Skipped (no side effects)     │
//! │       │ 1 row                                                           │
//! │       ▼                                                                 │
//! │  provider.sync(calendar, credentials, cursor)   ◄── catch_unwind       │
//! │       │                                                                 │
//! │       ├── Ok(events) ─► validate + sort                                │
//! │       │                 complete_success (token-guarded, one tx)       │
//! │       │                 changed? ─► notifier.notify_calendar_update    │
//! │       │                 ─► Synced { changed, event_count }             │
//! │       │                                                                 │
//! │       └── Err / panic ─► complete_failure (token-guarded, backoff)     │
//! │                          ─► Failed { message }                         │
//! │                                                                         │
//! │  The lock is released by whichever terminal write runs. Any error      │
//! │  after acquire (e.g. the success transaction failing) is recorded with │
//! │  complete_failure before it is returned; if even that write fails the  │
//! │  stale-lock recovery pass frees the row after the threshold.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use roomsign_core::backoff::next_sync_after_success;
use roomsign_core::{sort_fetched_events, Calendar, CalendarEvent};
use roomsign_db::{Completion, Database, SuccessWrite};

use crate::error::{ProviderError, SyncError, SyncResult};
use crate::provider::{ProviderRegistry, ProviderSyncResult};

// =============================================================================
// Update Notifier
// =============================================================================

/// Receives the new event set of a calendar after a sync changed it.
///
/// Implemented by the connection registry; processes without connected
/// displays use [`NoOpNotifier`].
pub trait UpdateNotifier: Send + Sync {
    fn notify_calendar_update(&self, calendar_id: &str, events: &[CalendarEvent]);
}

/// Notifier that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpNotifier;

impl UpdateNotifier for NoOpNotifier {
    fn notify_calendar_update(&self, _calendar_id: &str, _events: &[CalendarEvent]) {}
}

// =============================================================================
// Outcome
// =============================================================================

/// How one run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Events stored, lock released as `IDLE`.
    Synced { changed: bool, event_count: usize },
    /// Provider failed; recorded as `ERROR` with backoff.
    Failed { message: String },
    /// Lock held elsewhere, calendar gone, or results superseded.
    Skipped,
}

// =============================================================================
// Sync Runner
// =============================================================================

/// Executes single-calendar syncs.
#[derive(Clone)]
pub struct SyncRunner {
    db: Database,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<dyn UpdateNotifier>,
}

impl SyncRunner {
    pub fn new(
        db: Database,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        SyncRunner {
            db,
            providers,
            notifier,
        }
    }

    /// Runs one calendar's sync.
    ///
    /// ## Returns
    /// * `Ok(outcome)` - the run ended and the lock (if taken) was released
    /// * `Err(_)` - infrastructure failure; a held lock is released as
    ///   `ERROR` when the database still accepts the write
    pub async fn run(&self, calendar_id: &str) -> SyncResult<SyncOutcome> {
        let token = Uuid::new_v4().to_string();

        if !self.db.calendars().try_acquire(calendar_id, &token, Utc::now()).await? {
            debug!(calendar_id = %calendar_id, "Sync lock held elsewhere, skipping");
            return Ok(SyncOutcome::Skipped);
        }

        match self.run_locked(calendar_id, &token).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release_after_error(calendar_id, &token, &e).await;
                Err(e)
            }
        }
    }

    async fn run_locked(&self, calendar_id: &str, token: &str) -> SyncResult<SyncOutcome> {
        let Some(calendar) = self.db.calendars().get(calendar_id).await? else {
            return Ok(SyncOutcome::Skipped);
        };

        debug!(
            calendar_id = %calendar.id,
            provider = %calendar.provider,
            "Sync started"
        );

        let fetched = AssertUnwindSafe(self.fetch(&calendar)).catch_unwind().await;

        match fetched {
            Ok(Ok(result)) => self.finish_success(&calendar, token, result).await,
            Ok(Err(e)) => self.finish_failure(&calendar, token, e.to_string()).await,
            Err(panic) => {
                let message = format!("Provider panicked: {}", panic_message(panic.as_ref()));
                self.finish_failure(&calendar, token, message).await
            }
        }
    }

    /// Best-effort release of a lock whose run hit an infrastructure error.
    async fn release_after_error(&self, calendar_id: &str, token: &str, error: &SyncError) {
        let released = self
            .db
            .calendars()
            .complete_failure(calendar_id, token, &error.to_string(), Utc::now())
            .await;

        match released {
            Ok(Completion::Applied(consecutive_errors)) => {
                warn!(calendar_id = %calendar_id, consecutive_errors, ?error, "Sync aborted, lock released");
            }
            Ok(Completion::Superseded) => {}
            Err(release_error) => {
                warn!(
                    calendar_id = %calendar_id,
                    ?error,
                    ?release_error,
                    "Sync aborted and lock release failed; left for stale recovery"
                );
            }
        }
    }

    /// Calls the provider and normalizes its answer into storage order.
    async fn fetch(&self, calendar: &Calendar) -> Result<ProviderSyncResult, ProviderError> {
        let provider = self.providers.get(calendar.provider)?;
        let mut result = provider
            .sync(calendar, &calendar.credentials, calendar.sync_cursor.as_deref())
            .await?;

        for event in &result.events {
            event.validate()?;
        }
        sort_fetched_events(&mut result.events);
        if let Some(pair) = result
            .events
            .windows(2)
            .find(|pair| pair[0].external_id == pair[1].external_id)
        {
            return Err(ProviderError::InvalidResponse(format!(
                "duplicate event id '{}'",
                pair[0].external_id
            )));
        }

        Ok(result)
    }

    async fn finish_success(
        &self,
        calendar: &Calendar,
        token: &str,
        result: ProviderSyncResult,
    ) -> SyncResult<SyncOutcome> {
        let now = Utc::now();
        let write = SuccessWrite {
            calendar_id: &calendar.id,
            token,
            now,
            next_sync_at: next_sync_after_success(now, calendar.sync_interval_secs),
            next_cursor: result.next_cursor.as_deref(),
            events: &result.events,
        };

        match self.db.calendars().complete_success(&write).await? {
            Completion::Applied(stored) => {
                let event_count = stored.events.len();
                if stored.changed {
                    self.notifier.notify_calendar_update(&calendar.id, &stored.events);
                }
                info!(
                    calendar_id = %calendar.id,
                    event_count,
                    changed = stored.changed,
                    "Calendar synced"
                );
                Ok(SyncOutcome::Synced {
                    changed: stored.changed,
                    event_count,
                })
            }
            Completion::Superseded => {
                warn!(
                    calendar_id = %calendar.id,
                    "Sync result discarded: lock was taken over by another runner"
                );
                Ok(SyncOutcome::Skipped)
            }
        }
    }

    async fn finish_failure(
        &self,
        calendar: &Calendar,
        token: &str,
        message: String,
    ) -> SyncResult<SyncOutcome> {
        let completion = self
            .db
            .calendars()
            .complete_failure(&calendar.id, token, &message, Utc::now())
            .await?;

        match completion {
            Completion::Applied(consecutive_errors) => {
                debug!(
                    calendar_id = %calendar.id,
                    consecutive_errors,
                    error = %message,
                    "Calendar sync failed"
                );
            }
            Completion::Superseded => {
                warn!(
                    calendar_id = %calendar.id,
                    error = %message,
                    "Failure not recorded: lock was taken over by another runner"
                );
            }
        }

        Ok(SyncOutcome::Failed { message })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fetched, RecordingNotifier, Script, ScriptedProvider};
    use chrono::Duration;
    use roomsign_core::{ProviderKind, SyncStatus};
    use roomsign_db::DbConfig;

    struct Fixture {
        db: Database,
        provider: Arc<ScriptedProvider>,
        notifier: Arc<RecordingNotifier>,
        runner: SyncRunner,
    }

    async fn fixture() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let providers = ProviderRegistry::new().with(ProviderKind::Ics, provider.clone());
        let runner = SyncRunner::new(db.clone(), Arc::new(providers), notifier.clone());
        Fixture {
            db,
            provider,
            notifier,
            runner,
        }
    }

    async fn seed(db: &Database, id: &str, kind: ProviderKind) {
        db.calendars()
            .insert(&Calendar::new(id, format!("Room {id}"), kind, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_success_stores_events_and_notifies() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        let base = Utc::now();
        f.provider.script(
            "c1",
            Script::events_with_cursor(vec![fetched("b", base + Duration::hours(1)), fetched("a", base)], "cur-1"),
        );

        let outcome = f.runner.run("c1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                changed: true,
                event_count: 2
            }
        );

        let cal = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Idle);
        assert_eq!(cal.consecutive_errors, 0);
        assert_eq!(cal.last_sync_error, None);
        assert_eq!(cal.sync_cursor.as_deref(), Some("cur-1"));
        assert!(cal.last_sync_at.is_some());
        let next = cal.next_sync_at.unwrap();
        assert!(next >= cal.last_sync_at.unwrap() + Duration::seconds(300));

        let updates = f.notifier.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "c1");
        assert_eq!(updates[0].1, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unchanged_events_do_not_notify() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        let base = Utc::now();
        f.provider.script("c1", Script::events(vec![fetched("a", base)]));

        f.runner.run("c1").await.unwrap();
        let second = f.runner.run("c1").await.unwrap();

        assert_eq!(
            second,
            SyncOutcome::Synced {
                changed: false,
                event_count: 1
            }
        );
        assert_eq!(f.notifier.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_records_error_and_backoff() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        f.provider
            .script("c1", Script::Fail(ProviderError::Network("connection reset".into())));

        let outcome = f.runner.run("c1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Failed {
                message: "Network error: connection reset".into()
            }
        );

        let first = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(first.sync_status, SyncStatus::Error);
        assert_eq!(first.consecutive_errors, 1);
        assert_eq!(first.last_sync_error.as_deref(), Some("Network error: connection reset"));
        let first_delay = first.next_sync_at.unwrap() - first.updated_at;
        assert_eq!(first_delay, Duration::seconds(60));

        f.runner.run("c1").await.unwrap();
        let second = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(second.consecutive_errors, 2);
        assert_eq!(second.next_sync_at.unwrap() - second.updated_at, Duration::seconds(120));
        assert!(f.notifier.updates().is_empty());
    }

    #[tokio::test]
    async fn test_success_after_failures_resets_counter() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        f.provider.script("c1", Script::Fail(ProviderError::Auth("expired".into())));
        f.runner.run("c1").await.unwrap();

        f.provider.script("c1", Script::events(vec![]));
        let outcome = f.runner.run("c1").await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));

        let cal = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Idle);
        assert_eq!(cal.consecutive_errors, 0);
        assert_eq!(cal.last_sync_error, None);
    }

    #[tokio::test]
    async fn test_provider_panic_releases_lock_as_error() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        f.provider.script("c1", Script::Panic("parser exploded"));

        let outcome = f.runner.run("c1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Failed {
                message: "Provider panicked: parser exploded".into()
            }
        );

        let cal = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Error);
        assert_eq!(cal.sync_token, None);
    }

    #[tokio::test]
    async fn test_database_error_after_acquire_releases_lock() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        sqlx::query(
            "CREATE TRIGGER reject_events BEFORE INSERT ON calendar_events \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(f.db.pool())
        .await
        .unwrap();
        f.provider.script("c1", Script::events(vec![fetched("a", Utc::now())]));

        let err = f.runner.run("c1").await.unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");

        let cal = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Error);
        assert_eq!(cal.sync_token, None);
        assert_eq!(cal.consecutive_errors, 1);
        assert!(cal.last_sync_error.unwrap().contains("disk full"));
        assert!(cal.next_sync_at.is_some());
        assert_eq!(f.db.events().count_for_calendar("c1").await.unwrap(), 0);
        assert!(f.notifier.updates().is_empty());

        // The calendar is selectable again once the backoff passes.
        let retry_at = cal.next_sync_at.unwrap();
        let due = f.db.calendars().select_due(retry_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_held_lock_is_skipped_without_side_effects() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        let now = Utc::now();
        assert!(f.db.calendars().try_acquire("c1", "other-runner", now).await.unwrap());
        let before = f.db.calendars().get("c1").await.unwrap().unwrap();

        let outcome = f.runner.run("c1").await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);

        let after = f.db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(f.provider.calls("c1"), 0);
    }

    #[tokio::test]
    async fn test_unknown_calendar_is_skipped() {
        let f = fixture().await;
        assert_eq!(f.runner.run("missing").await.unwrap(), SyncOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_unregistered_provider_fails_the_sync() {
        let f = fixture().await;
        seed(&f.db, "g1", ProviderKind::Google).await;

        let outcome = f.runner.run("g1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Failed {
                message: "No provider registered for GOOGLE".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_events_fail_the_sync() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        let base = Utc::now();
        f.provider
            .script("c1", Script::events(vec![fetched("dup", base), fetched("dup", base)]));

        let outcome = f.runner.run("c1").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Failed {
                message: "Invalid response: duplicate event id 'dup'".into()
            }
        );
        assert_eq!(f.db.events().count_for_calendar("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cursor_is_passed_back() {
        let f = fixture().await;
        seed(&f.db, "c1", ProviderKind::Ics).await;
        f.provider.script("c1", Script::events_with_cursor(vec![], "next-page"));
        f.runner.run("c1").await.unwrap();
        f.runner.run("c1").await.unwrap();

        assert_eq!(
            f.provider.cursors("c1"),
            vec![None, Some("next-page".to_string())]
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
