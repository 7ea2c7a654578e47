//! # Calendar Event Repository
//!
//! Read access to synced events, plus the crate-internal helpers the calendar
//! repository uses to replace an event set inside its completion transaction.

use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::error::DbResult;
use roomsign_core::{CalendarEvent, FetchedEvent};

const EVENT_COLUMNS: &str =
    "id, calendar_id, external_id, title, starts_at, ends_at, all_day, organizer, location";

/// Repository for calendar events.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Events of one calendar in storage order (`starts_at`, `external_id`).
    pub async fn list_for_calendar(&self, calendar_id: &str) -> DbResult<Vec<CalendarEvent>> {
        fetch_events(&self.pool, calendar_id).await
    }

    /// Events of several calendars merged into one list ordered by start time.
    ///
    /// Used for the `init` frame of a display. Calendars are read in the
    /// order given, so ties on `starts_at` keep that order.
    pub async fn list_for_calendars(&self, calendar_ids: &[String]) -> DbResult<Vec<CalendarEvent>> {
        let mut events = Vec::new();
        for calendar_id in calendar_ids {
            events.extend(fetch_events(&self.pool, calendar_id).await?);
        }
        events.sort_by_key(|e| e.starts_at);
        Ok(events)
    }

    /// Number of events stored for a calendar.
    pub async fn count_for_calendar(&self, calendar_id: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM calendar_events WHERE calendar_id = ?1")
            .bind(calendar_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Crate-internal helpers
// =============================================================================

pub(crate) async fn fetch_events<'e, E>(executor: E, calendar_id: &str) -> DbResult<Vec<CalendarEvent>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM calendar_events \
         WHERE calendar_id = ?1 ORDER BY starts_at, external_id"
    );
    let events = sqlx::query_as::<_, CalendarEvent>(&sql)
        .bind(calendar_id)
        .fetch_all(executor)
        .await?;
    Ok(events)
}

/// Deletes the stored set and inserts `fetched` with fresh local ids.
///
/// Must run inside the caller's transaction.
pub(crate) async fn replace_events(
    conn: &mut SqliteConnection,
    calendar_id: &str,
    fetched: &[FetchedEvent],
) -> DbResult<Vec<CalendarEvent>> {
    sqlx::query("DELETE FROM calendar_events WHERE calendar_id = ?1")
        .bind(calendar_id)
        .execute(&mut *conn)
        .await?;

    let mut stored = Vec::with_capacity(fetched.len());
    for event in fetched {
        let event = event.clone().into_event(Uuid::new_v4().to_string(), calendar_id);
        sqlx::query(
            r#"
            INSERT INTO calendar_events (
                id, calendar_id, external_id, title, starts_at,
                ends_at, all_day, organizer, location
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&event.id)
        .bind(&event.calendar_id)
        .bind(&event.external_id)
        .bind(&event.title)
        .bind(event.starts_at)
        .bind(event.ends_at)
        .bind(event.all_day)
        .bind(&event.organizer)
        .bind(&event.location)
        .execute(&mut *conn)
        .await?;
        stored.push(event);
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::calendar::SuccessWrite;
    use chrono::{Duration, Utc};
    use roomsign_core::{Calendar, ProviderKind};

    fn fetched(external_id: &str, starts_at: chrono::DateTime<Utc>) -> FetchedEvent {
        FetchedEvent {
            external_id: external_id.to_string(),
            title: external_id.to_uppercase(),
            starts_at,
            ends_at: starts_at + Duration::minutes(45),
            all_day: false,
            organizer: Some("facilities@example.com".to_string()),
            location: None,
        }
    }

    async fn seed(db: &Database, calendar_id: &str, events: &[FetchedEvent]) {
        let now = Utc::now();
        let repo = db.calendars();
        repo.insert(&Calendar::new(calendar_id, calendar_id, ProviderKind::Google, now))
            .await
            .unwrap();
        assert!(repo.try_acquire(calendar_id, "seed", now).await.unwrap());
        repo.complete_success(&SuccessWrite {
            calendar_id,
            token: "seed",
            now,
            next_sync_at: now + Duration::minutes(5),
            next_cursor: None,
            events,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_for_calendars_merges_by_start() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let base = Utc::now();

        seed(&db, "room", &[fetched("r1", base), fetched("r2", base + Duration::hours(2))]).await;
        seed(&db, "shared", &[fetched("s1", base + Duration::hours(1))]).await;

        let events = db.events();
        assert_eq!(events.count_for_calendar("room").await.unwrap(), 2);

        let merged = events
            .list_for_calendars(&["room".to_string(), "shared".to_string()])
            .await
            .unwrap();
        let ids: Vec<_> = merged.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, ["r1", "s1", "r2"]);
        assert_eq!(merged[1].calendar_id, "shared");
        assert_eq!(merged[0].organizer.as_deref(), Some("facilities@example.com"));
    }

    #[tokio::test]
    async fn test_unknown_calendar_has_no_events() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.events().list_for_calendar("nope").await.unwrap().is_empty());
    }
}
