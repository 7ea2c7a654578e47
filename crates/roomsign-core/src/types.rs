//! # Domain Types
//!
//! Calendars, their synced events and the displays that render them.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Calendar     │   │  CalendarEvent  │   │     Display     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │◄──│  calendar_id    │   │  id             │       │
//! │  │  provider       │   │  external_id    │   │  room_calendar  │──┐    │
//! │  │  sync_status ◄──┼─┐ │  starts_at      │   │  config (JSON)  │  │    │
//! │  │  sync_token     │ │ │  ends_at        │   │  calendar_ids   │──┤    │
//! │  │  next_sync_at   │ │ └─────────────────┘   └─────────────────┘  │    │
//! │  └─────────────────┘ │                                             │    │
//! │          ▲           │ ┌─────────────────┐                         │    │
//! │          │           └─│   SyncStatus    │                         │    │
//! │          │             │  IDLE           │                         │    │
//! │          │             │  SYNCING (lock) │                         │    │
//! │          │             │  ERROR          │                         │    │
//! │          │             └─────────────────┘                         │    │
//! │          └─────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## The Sync Status Lock
//! `sync_status` doubles as a per-calendar mutual-exclusion lock shared by
//! every process that can sync (web server, standalone worker, cron trigger).
//! `SYNCING` means some runner holds it; `sync_token` names which one.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Sync Status
// =============================================================================

/// Sync state of a calendar.
///
/// ## State Machine
/// ```text
///   IDLE ──acquire──► SYNCING ──success──► IDLE
///   ERROR ─acquire──►    │    ──failure──► ERROR
///                        └──── stale (5 min) ──► ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum SyncStatus {
    /// Not syncing; last run succeeded (or never ran).
    Idle,
    /// A runner holds the lock.
    Syncing,
    /// Last run failed or was recovered from an abandoned lock.
    Error,
}

impl SyncStatus {
    /// Stored representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "IDLE",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::Error => "ERROR",
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Idle
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(SyncStatus::Idle),
            "SYNCING" => Ok(SyncStatus::Syncing),
            "ERROR" => Ok(SyncStatus::Error),
            other => Err(CoreError::UnknownSyncStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Provider Kind
// =============================================================================

/// External calendar system a calendar is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ProviderKind {
    Exchange,
    Google,
    Caldav,
    Ics,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Exchange,
        ProviderKind::Google,
        ProviderKind::Caldav,
        ProviderKind::Ics,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Exchange => "EXCHANGE",
            ProviderKind::Google => "GOOGLE",
            ProviderKind::Caldav => "CALDAV",
            ProviderKind::Ics => "ICS",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownProvider(s.to_string()))
    }
}

// =============================================================================
// Calendar
// =============================================================================

/// A connected external calendar.
///
/// Owned by the admin application; the sync core only reads it and writes
/// the sync-state columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Calendar {
    /// Unique identifier.
    pub id: String,

    /// Display name (used in logs and the health view).
    pub name: String,

    /// Which provider implementation syncs this calendar.
    pub provider: ProviderKind,

    /// Disabled calendars are never selected for sync.
    pub enabled: bool,

    /// Opaque provider credentials (JSON text). Never serialized outward.
    #[serde(skip_serializing, default)]
    #[ts(skip)]
    pub credentials: String,

    /// Refresh interval after a successful sync.
    pub sync_interval_secs: i64,

    /// Lock / state column.
    pub sync_status: SyncStatus,

    /// Token of the runner currently holding (or last holding) the lock.
    pub sync_token: Option<String>,

    /// Provider cursor from the last successful run.
    pub sync_cursor: Option<String>,

    pub last_sync_at: Option<DateTime<Utc>>,

    pub last_sync_error: Option<String>,

    /// Failures since the last success.
    pub consecutive_errors: i64,

    /// `None` or a past instant means "due".
    pub next_sync_at: Option<DateTime<Utc>>,

    /// Set only when a successful sync changed the stored event set.
    pub events_changed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Refreshed on every write. Staleness of a `SYNCING` lock is judged on it.
    pub updated_at: DateTime<Utc>,
}

impl Calendar {
    /// Creates an enabled, never-synced calendar.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Self {
        Calendar {
            id: id.into(),
            name: name.into(),
            provider,
            enabled: true,
            credentials: "{}".to_string(),
            sync_interval_secs: crate::backoff::DEFAULT_SYNC_INTERVAL_SECS,
            sync_status: SyncStatus::Idle,
            sync_token: None,
            sync_cursor: None,
            last_sync_at: None,
            last_sync_error: None,
            consecutive_errors: 0,
            next_sync_at: None,
            events_changed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sync-state projection of a calendar for the health view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CalendarSyncState {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub consecutive_errors: i64,
    pub next_sync_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Calendar Events
// =============================================================================

/// A stored event of a calendar, as pushed to displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CalendarEvent {
    pub id: String,
    pub calendar_id: String,
    /// Identifier assigned by the provider; unique within a calendar.
    pub external_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub organizer: Option<String>,
    pub location: Option<String>,
}

/// An event as returned by a provider, before it gets a local id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedEvent {
    pub external_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub organizer: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl FetchedEvent {
    /// Rejects events a display could not render.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.external_id.trim().is_empty() {
            return Err(CoreError::invalid_event(&self.external_id, "missing external id"));
        }
        if self.ends_at < self.starts_at {
            return Err(CoreError::invalid_event(&self.external_id, "ends before it starts"));
        }
        Ok(())
    }

    /// Attaches a local id and the owning calendar.
    pub fn into_event(self, id: String, calendar_id: &str) -> CalendarEvent {
        CalendarEvent {
            id,
            calendar_id: calendar_id.to_string(),
            external_id: self.external_id,
            title: self.title,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            all_day: self.all_day,
            organizer: self.organizer,
            location: self.location,
        }
    }
}

/// Fields that decide whether two events look the same on a display.
type EventContent<'a> = (
    &'a str,
    &'a str,
    DateTime<Utc>,
    DateTime<Utc>,
    bool,
    Option<&'a str>,
    Option<&'a str>,
);

impl CalendarEvent {
    fn content(&self) -> EventContent<'_> {
        (
            &self.external_id,
            &self.title,
            self.starts_at,
            self.ends_at,
            self.all_day,
            self.organizer.as_deref(),
            self.location.as_deref(),
        )
    }
}

impl FetchedEvent {
    fn content(&self) -> EventContent<'_> {
        (
            &self.external_id,
            &self.title,
            self.starts_at,
            self.ends_at,
            self.all_day,
            self.organizer.as_deref(),
            self.location.as_deref(),
        )
    }
}

/// Sorts fetched events into storage order: `starts_at`, then `external_id`.
pub fn sort_fetched_events(events: &mut [FetchedEvent]) {
    events.sort_by(|a, b| {
        a.starts_at
            .cmp(&b.starts_at)
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
}

/// Compares a stored event set with a freshly fetched one.
///
/// Both slices must already be in storage order. Local ids are ignored.
pub fn event_sets_differ(stored: &[CalendarEvent], fetched: &[FetchedEvent]) -> bool {
    stored.len() != fetched.len()
        || stored
            .iter()
            .zip(fetched)
            .any(|(s, f)| s.content() != f.content())
}

// =============================================================================
// Display
// =============================================================================

/// A kiosk display and the calendars it shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Display {
    pub id: String,
    pub name: String,
    pub room_calendar_id: Option<String>,
    /// Free-form rendering configuration owned by the admin application.
    pub config: serde_json::Value,
    /// Room calendar first, then attached calendars, without duplicates.
    pub calendar_ids: Vec<String>,
}

impl Display {
    /// Builds the ordered calendar id list of a display.
    ///
    /// `attached` must already be in position order.
    pub fn merge_calendar_ids(room_calendar_id: Option<&str>, attached: &[String]) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(attached.len() + 1);
        for id in room_calendar_id.into_iter().chain(attached.iter().map(String::as_str)) {
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn fetched(external_id: &str, hour: u32) -> FetchedEvent {
        FetchedEvent {
            external_id: external_id.to_string(),
            title: format!("Meeting {external_id}"),
            starts_at: at(hour),
            ends_at: at(hour + 1),
            all_day: false,
            organizer: None,
            location: Some("Room 1".to_string()),
        }
    }

    #[test]
    fn test_sync_status_round_trips_through_str() {
        for status in [SyncStatus::Idle, SyncStatus::Syncing, SyncStatus::Error] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_sync_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&SyncStatus::Syncing).unwrap(), "\"SYNCING\"");
    }

    #[test]
    fn test_provider_kind_parse_is_case_insensitive() {
        assert_eq!("caldav".parse::<ProviderKind>().unwrap(), ProviderKind::Caldav);
        assert_eq!(
            "outlook".parse::<ProviderKind>(),
            Err(CoreError::UnknownProvider("outlook".to_string()))
        );
    }

    #[test]
    fn test_calendar_json_hides_credentials() {
        let mut cal = Calendar::new("c1", "Lobby", ProviderKind::Google, at(9));
        cal.credentials = r#"{"token":"secret"}"#.to_string();
        let json = serde_json::to_string(&cal).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"syncStatus\":\"IDLE\""));
    }

    #[test]
    fn test_fetched_event_validation() {
        assert!(fetched("a", 9).validate().is_ok());

        let mut backwards = fetched("b", 9);
        backwards.ends_at = at(8);
        assert!(backwards.validate().is_err());

        let mut anonymous = fetched(" ", 9);
        anonymous.external_id = " ".to_string();
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn test_sort_orders_by_start_then_external_id() {
        let mut events = vec![fetched("z", 10), fetched("b", 9), fetched("a", 9)];
        sort_fetched_events(&mut events);
        let ids: Vec<_> = events.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "z"]);
    }

    #[test]
    fn test_event_sets_differ_ignores_local_ids() {
        let fresh = vec![fetched("a", 9), fetched("b", 10)];
        let stored: Vec<CalendarEvent> = fresh
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, e)| e.into_event(format!("local-{i}"), "cal"))
            .collect();

        assert!(!event_sets_differ(&stored, &fresh));

        let mut retitled = fresh.clone();
        retitled[1].title = "Moved".to_string();
        assert!(event_sets_differ(&stored, &retitled));

        assert!(event_sets_differ(&stored, &fresh[..1]));
        assert!(event_sets_differ(&[], &fresh));
        assert!(!event_sets_differ(&[], &[]));
    }

    #[test]
    fn test_display_calendar_ids_room_first_without_duplicates() {
        let attached = vec!["b".to_string(), "room".to_string(), "c".to_string(), "b".to_string()];
        assert_eq!(
            Display::merge_calendar_ids(Some("room"), &attached),
            vec!["room", "b", "c"]
        );
        assert_eq!(Display::merge_calendar_ids(None, &attached), vec!["b", "room", "c"]);
    }
}
