//! # Calendar Repository
//!
//! Sync state of calendars, including the row-level lock.
//!
//! ## Lock Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Calendar Row Lock                                    │
//! │                                                                         │
//! │  try_acquire(id, token)                                                │
//! │    UPDATE calendars SET sync_status='SYNCING', sync_token=:token        │
//! │     WHERE id=:id AND sync_status != 'SYNCING'                          │
//! │    1 row  → lock held by :token                                        │
//! │    0 rows → someone else holds it (or no such calendar)                │
//! │                                                                         │
//! │  complete_success / complete_failure                                   │
//! │    UPDATE ... WHERE id=:id AND sync_token=:token                       │
//! │    0 rows → superseded by a newer runner, nothing written              │
//! │                                                                         │
//! │  recover_stale(threshold)                                              │
//! │    UPDATE calendars SET sync_status='ERROR', next_sync_at=:now          │
//! │     WHERE sync_status='SYNCING' AND updated_at <= :threshold           │
//! │    (token untouched: the original runner can still finish)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every statement is a single conditional UPDATE, never read-then-write.
//! SQLite serializes writers, so each WHERE clause is evaluated atomically
//! per row even with several processes on one file.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::event::{fetch_events, replace_events};
use roomsign_core::backoff::next_sync_after_failure;
use roomsign_core::{event_sets_differ, Calendar, CalendarEvent, CalendarSyncState, FetchedEvent};

const CALENDAR_COLUMNS: &str = "id, name, provider, enabled, credentials, sync_interval_secs, \
     sync_status, sync_token, sync_cursor, last_sync_at, last_sync_error, \
     consecutive_errors, next_sync_at, events_changed_at, created_at, updated_at";

// =============================================================================
// Completion Types
// =============================================================================

/// One committed event-set change, from the `calendar_changes` log.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CalendarChange {
    /// Commit-ordered sequence number.
    pub seq: i64,
    pub calendar_id: String,
    pub changed_at: DateTime<Utc>,
}

/// Everything a successful run writes back.
#[derive(Debug, Clone)]
pub struct SuccessWrite<'a> {
    pub calendar_id: &'a str,
    /// Lock token obtained from `try_acquire`.
    pub token: &'a str,
    pub now: DateTime<Utc>,
    pub next_sync_at: DateTime<Utc>,
    pub next_cursor: Option<&'a str>,
    /// Fetched events, already validated and in storage order.
    pub events: &'a [FetchedEvent],
}

/// Result of a token-guarded terminal write.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    /// The row still carried our token; the write is committed.
    Applied(T),
    /// Another runner took the lock since; nothing was written.
    Superseded,
}

/// What a successful completion left in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvents {
    /// Whether the stored event set changed.
    pub changed: bool,
    /// Event set now stored, in storage order.
    pub events: Vec<CalendarEvent>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for calendar sync state.
#[derive(Debug, Clone)]
pub struct CalendarRepository {
    pool: SqlitePool,
}

impl CalendarRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CalendarRepository { pool }
    }

    /// Inserts a calendar row as-is.
    ///
    /// Calendars are normally created by the admin application; this is used
    /// for seeding and tests.
    pub async fn insert(&self, calendar: &Calendar) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendars (
                id, name, provider, enabled, credentials, sync_interval_secs,
                sync_status, sync_token, sync_cursor, last_sync_at, last_sync_error,
                consecutive_errors, next_sync_at, events_changed_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16
            )
            "#,
        )
        .bind(&calendar.id)
        .bind(&calendar.name)
        .bind(calendar.provider)
        .bind(calendar.enabled)
        .bind(&calendar.credentials)
        .bind(calendar.sync_interval_secs)
        .bind(calendar.sync_status)
        .bind(&calendar.sync_token)
        .bind(&calendar.sync_cursor)
        .bind(calendar.last_sync_at)
        .bind(&calendar.last_sync_error)
        .bind(calendar.consecutive_errors)
        .bind(calendar.next_sync_at)
        .bind(calendar.events_changed_at)
        .bind(calendar.created_at)
        .bind(calendar.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gets a calendar by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Calendar>> {
        let sql = format!("SELECT {CALENDAR_COLUMNS} FROM calendars WHERE id = ?1");
        let calendar = sqlx::query_as::<_, Calendar>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(calendar)
    }

    /// Forces abandoned locks into a retryable `ERROR` state.
    ///
    /// A calendar is abandoned when it is `SYNCING` and its `updated_at` is
    /// at or before `threshold`. One bulk conditional UPDATE.
    ///
    /// ## Returns
    /// Number of recovered calendars.
    pub async fn recover_stale(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
        message: &str,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE calendars SET
                sync_status = 'ERROR',
                last_sync_error = ?1,
                next_sync_at = ?2,
                updated_at = ?2
            WHERE sync_status = 'SYNCING'
              AND updated_at <= ?3
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(threshold)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Calendars due for sync: enabled, not locked, `next_sync_at` unset or
    /// not in the future.
    ///
    /// Never-scheduled calendars come first, then by `next_sync_at`, then id.
    pub async fn select_due(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<Calendar>> {
        let sql = format!(
            r#"
            SELECT {CALENDAR_COLUMNS} FROM calendars
            WHERE enabled = 1
              AND sync_status != 'SYNCING'
              AND (next_sync_at IS NULL OR next_sync_at <= ?1)
            ORDER BY next_sync_at IS NOT NULL, next_sync_at, id
            LIMIT ?2
            "#
        );
        let calendars = sqlx::query_as::<_, Calendar>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(calendars)
    }

    /// Takes the sync lock of a calendar.
    ///
    /// ## Returns
    /// * `true` - lock is now held under `token`
    /// * `false` - already `SYNCING`, or no such calendar
    pub async fn try_acquire(&self, id: &str, token: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE calendars SET
                sync_status = 'SYNCING',
                sync_token = ?2,
                updated_at = ?3
            WHERE id = ?1
              AND sync_status != 'SYNCING'
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(calendar_id = %id, acquired, "Sync lock attempt");
        Ok(acquired)
    }

    /// Records a successful run and releases the lock.
    ///
    /// In one transaction: the token-guarded status write, then (only if the
    /// fetched set differs from the stored one) the event replacement,
    /// `events_changed_at` and a `calendar_changes` entry.
    pub async fn complete_success(&self, write: &SuccessWrite<'_>) -> DbResult<Completion<StoredEvents>> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds SQLite's write lock from the start.
        let result = sqlx::query(
            r#"
            UPDATE calendars SET
                sync_status = 'IDLE',
                sync_token = NULL,
                sync_cursor = ?3,
                last_sync_at = ?4,
                last_sync_error = NULL,
                consecutive_errors = 0,
                next_sync_at = ?5,
                updated_at = ?4
            WHERE id = ?1
              AND sync_token = ?2
            "#,
        )
        .bind(write.calendar_id)
        .bind(write.token)
        .bind(write.next_cursor)
        .bind(write.now)
        .bind(write.next_sync_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(Completion::Superseded);
        }

        let stored = fetch_events(&mut *tx, write.calendar_id).await?;
        if !event_sets_differ(&stored, write.events) {
            tx.commit().await?;
            return Ok(Completion::Applied(StoredEvents {
                changed: false,
                events: stored,
            }));
        }

        let events = replace_events(&mut *tx, write.calendar_id, write.events).await?;

        sqlx::query("UPDATE calendars SET events_changed_at = ?2 WHERE id = ?1")
            .bind(write.calendar_id)
            .bind(write.now)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO calendar_changes (calendar_id, changed_at) VALUES (?1, ?2)")
            .bind(write.calendar_id)
            .bind(write.now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Completion::Applied(StoredEvents {
            changed: true,
            events,
        }))
    }

    /// Records a failed run and releases the lock.
    ///
    /// Increments `consecutive_errors` and schedules the retry from the
    /// incremented count.
    ///
    /// ## Returns
    /// The new `consecutive_errors` when applied.
    pub async fn complete_failure(
        &self,
        id: &str,
        token: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Completion<i64>> {
        let mut tx = self.pool.begin().await?;

        let errors: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE calendars SET
                sync_status = 'ERROR',
                sync_token = NULL,
                last_sync_error = ?3,
                consecutive_errors = consecutive_errors + 1,
                updated_at = ?4
            WHERE id = ?1
              AND sync_token = ?2
            RETURNING consecutive_errors
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(message)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(errors) = errors else {
            tx.rollback().await?;
            return Ok(Completion::Superseded);
        };

        sqlx::query("UPDATE calendars SET next_sync_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(next_sync_after_failure(now, errors))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Completion::Applied(errors))
    }

    /// Sync state of every calendar, for the health view.
    pub async fn list_sync_states(&self) -> DbResult<Vec<CalendarSyncState>> {
        let states = sqlx::query_as::<_, CalendarSyncState>(
            r#"
            SELECT id, name, enabled, sync_status, last_sync_at, last_sync_error,
                   consecutive_errors, next_sync_at
            FROM calendars
            ORDER BY name, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    /// Change log entries after `seq`, in commit order.
    pub async fn changes_after(&self, seq: i64) -> DbResult<Vec<CalendarChange>> {
        let changes = sqlx::query_as::<_, CalendarChange>(
            r#"
            SELECT seq, calendar_id, changed_at FROM calendar_changes
            WHERE seq > ?1
            ORDER BY seq
            "#,
        )
        .bind(seq)
        .fetch_all(&self.pool)
        .await?;
        Ok(changes)
    }

    /// Highest committed change sequence, 0 when the log is empty.
    pub async fn latest_change_seq(&self) -> DbResult<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM calendar_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;
    use roomsign_core::{ProviderKind, SyncStatus};

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn calendar(id: &str, now: DateTime<Utc>) -> Calendar {
        Calendar::new(id, format!("Room {id}"), ProviderKind::Ics, now)
    }

    fn fetched(external_id: &str, start: DateTime<Utc>) -> FetchedEvent {
        FetchedEvent {
            external_id: external_id.to_string(),
            title: format!("Meeting {external_id}"),
            starts_at: start,
            ends_at: start + Duration::minutes(30),
            all_day: false,
            organizer: None,
            location: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = db().await;
        let now = Utc::now();
        let cal = calendar("c1", now);
        db.calendars().insert(&cal).await.unwrap();

        let loaded = db.calendars().get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Room c1");
        assert_eq!(loaded.sync_status, SyncStatus::Idle);
        assert_eq!(loaded.updated_at, now);
        assert!(db.calendars().get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_stale_only_touches_old_locks() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();

        let mut stuck = calendar("stuck", now - Duration::minutes(10));
        stuck.sync_status = SyncStatus::Syncing;
        stuck.sync_token = Some("t-old".to_string());
        repo.insert(&stuck).await.unwrap();

        let mut busy = calendar("busy", now - Duration::minutes(1));
        busy.sync_status = SyncStatus::Syncing;
        repo.insert(&busy).await.unwrap();

        let idle_old = calendar("idle", now - Duration::hours(1));
        repo.insert(&idle_old).await.unwrap();

        let recovered = repo
            .recover_stale(now - Duration::minutes(5), now, "Sync timed out")
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let stuck = repo.get("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.sync_status, SyncStatus::Error);
        assert_eq!(stuck.last_sync_error.as_deref(), Some("Sync timed out"));
        assert_eq!(stuck.next_sync_at, Some(now));
        assert_eq!(stuck.sync_token.as_deref(), Some("t-old"));

        assert_eq!(repo.get("busy").await.unwrap().unwrap().sync_status, SyncStatus::Syncing);
        assert_eq!(repo.get("idle").await.unwrap().unwrap().sync_status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_select_due_filters_and_limits() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();

        let mut scheduled = calendar("a-scheduled", now);
        scheduled.next_sync_at = Some(now - Duration::minutes(1));
        repo.insert(&scheduled).await.unwrap();

        repo.insert(&calendar("b-never", now)).await.unwrap();

        let mut future = calendar("c-future", now);
        future.next_sync_at = Some(now + Duration::minutes(5));
        repo.insert(&future).await.unwrap();

        let mut disabled = calendar("d-disabled", now);
        disabled.enabled = false;
        repo.insert(&disabled).await.unwrap();

        let mut syncing = calendar("e-syncing", now);
        syncing.sync_status = SyncStatus::Syncing;
        repo.insert(&syncing).await.unwrap();

        let mut errored = calendar("f-error", now);
        errored.sync_status = SyncStatus::Error;
        errored.next_sync_at = Some(now);
        repo.insert(&errored).await.unwrap();

        let due: Vec<String> = repo
            .select_due(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(due, vec!["b-never", "a-scheduled", "f-error"]);

        let capped = repo.select_due(now, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_try_acquire_is_exclusive() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();
        repo.insert(&calendar("c1", now)).await.unwrap();

        assert!(repo.try_acquire("c1", "t1", now).await.unwrap());
        assert!(!repo.try_acquire("c1", "t2", now).await.unwrap());
        assert!(!repo.try_acquire("missing", "t3", now).await.unwrap());

        let held = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(held.sync_status, SyncStatus::Syncing);
        assert_eq!(held.sync_token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_complete_success_replaces_events_only_when_changed() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();
        repo.insert(&calendar("c1", now)).await.unwrap();

        let events = vec![fetched("a", now), fetched("b", now + Duration::hours(1))];

        assert!(repo.try_acquire("c1", "t1", now).await.unwrap());
        let first = repo
            .complete_success(&SuccessWrite {
                calendar_id: "c1",
                token: "t1",
                now,
                next_sync_at: now + Duration::minutes(5),
                next_cursor: Some("cursor-1"),
                events: &events,
            })
            .await
            .unwrap();
        let Completion::Applied(first) = first else {
            panic!("expected applied");
        };
        assert!(first.changed);
        assert_eq!(first.events.len(), 2);

        let cal = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Idle);
        assert_eq!(cal.sync_token, None);
        assert_eq!(cal.sync_cursor.as_deref(), Some("cursor-1"));
        assert_eq!(cal.consecutive_errors, 0);
        assert_eq!(cal.events_changed_at, Some(now));

        let later = now + Duration::minutes(5);
        assert!(repo.try_acquire("c1", "t2", later).await.unwrap());
        let second = repo
            .complete_success(&SuccessWrite {
                calendar_id: "c1",
                token: "t2",
                now: later,
                next_sync_at: later + Duration::minutes(5),
                next_cursor: None,
                events: &events,
            })
            .await
            .unwrap();
        let Completion::Applied(second) = second else {
            panic!("expected applied");
        };
        assert!(!second.changed);
        assert_eq!(second.events, first.events, "unchanged sets keep their local ids");
        assert_eq!(
            repo.get("c1").await.unwrap().unwrap().events_changed_at,
            Some(now)
        );
    }

    #[tokio::test]
    async fn test_complete_failure_backs_off() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();
        repo.insert(&calendar("c1", now)).await.unwrap();

        for expected in 1..=3 {
            let token = format!("t{expected}");
            assert!(repo.try_acquire("c1", &token, now).await.unwrap());
            let done = repo.complete_failure("c1", &token, "boom", now).await.unwrap();
            assert_eq!(done, Completion::Applied(expected));
        }

        let cal = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Error);
        assert_eq!(cal.last_sync_error.as_deref(), Some("boom"));
        assert_eq!(cal.consecutive_errors, 3);
        assert_eq!(cal.next_sync_at, Some(now + Duration::minutes(4)));
    }

    #[tokio::test]
    async fn test_superseded_runner_cannot_release_new_lock() {
        let db = db().await;
        let repo = db.calendars();
        let start = Utc::now() - Duration::minutes(10);
        repo.insert(&calendar("c1", start)).await.unwrap();

        assert!(repo.try_acquire("c1", "old", start).await.unwrap());

        let now = Utc::now();
        repo.recover_stale(now - Duration::minutes(5), now, "Sync timed out")
            .await
            .unwrap();
        assert!(repo.try_acquire("c1", "new", now).await.unwrap());

        let late = repo.complete_failure("c1", "old", "late", now).await.unwrap();
        assert_eq!(late, Completion::Superseded);

        let cal = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Syncing);
        assert_eq!(cal.sync_token.as_deref(), Some("new"));
        assert_eq!(cal.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_original_runner_wins_after_recovery() {
        let db = db().await;
        let repo = db.calendars();
        let start = Utc::now() - Duration::minutes(10);
        repo.insert(&calendar("c1", start)).await.unwrap();
        assert!(repo.try_acquire("c1", "slow", start).await.unwrap());

        let now = Utc::now();
        repo.recover_stale(now - Duration::minutes(5), now, "Sync timed out")
            .await
            .unwrap();

        let done = repo
            .complete_success(&SuccessWrite {
                calendar_id: "c1",
                token: "slow",
                now,
                next_sync_at: now + Duration::minutes(5),
                next_cursor: None,
                events: &[],
            })
            .await
            .unwrap();
        assert!(matches!(done, Completion::Applied(_)));

        let cal = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(cal.sync_status, SyncStatus::Idle);
        assert_eq!(cal.last_sync_error, None);
    }

    #[tokio::test]
    async fn test_change_log_and_sync_states() {
        let db = db().await;
        let repo = db.calendars();
        let now = Utc::now();
        for id in ["a", "b", "never"] {
            repo.insert(&calendar(id, now)).await.unwrap();
        }
        assert_eq!(repo.latest_change_seq().await.unwrap(), 0);

        // "b" commits first but carries the later timestamp.
        for (id, at) in [("b", now + Duration::seconds(5)), ("a", now)] {
            let token = format!("t-{id}");
            assert!(repo.try_acquire(id, &token, at).await.unwrap());
            repo.complete_success(&SuccessWrite {
                calendar_id: id,
                token: &token,
                now: at,
                next_sync_at: at + Duration::minutes(5),
                next_cursor: None,
                events: &[fetched("e1", now)],
            })
            .await
            .unwrap();
        }

        let changes = repo.changes_after(0).await.unwrap();
        let ids: Vec<&str> = changes.iter().map(|c| c.calendar_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(changes[0].seq < changes[1].seq);
        assert_eq!(changes[1].changed_at, now);

        let latest = repo.latest_change_seq().await.unwrap();
        assert_eq!(latest, changes[1].seq);
        assert!(repo.changes_after(latest).await.unwrap().is_empty());
        assert_eq!(repo.changes_after(changes[0].seq).await.unwrap().len(), 1);

        let states = repo.list_sync_states().await.unwrap();
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|s| s.sync_status == SyncStatus::Idle));
    }
}
