//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use roomsign_core::{Calendar, CalendarEvent, FetchedEvent};

use crate::error::ProviderError;
use crate::provider::{CalendarProvider, ProviderSyncResult};
use crate::registry::{PushFrame, PushSink, SinkClosed};
use crate::runner::UpdateNotifier;

pub fn fetched(external_id: &str, starts_at: DateTime<Utc>) -> FetchedEvent {
    FetchedEvent {
        external_id: external_id.to_string(),
        title: format!("Meeting {external_id}"),
        starts_at,
        ends_at: starts_at + chrono::Duration::minutes(30),
        all_day: false,
        organizer: None,
        location: None,
    }
}

// =============================================================================
// Scripted Provider
// =============================================================================

/// What the scripted provider does for one calendar.
#[derive(Debug, Clone)]
pub enum Script {
    Events(ProviderSyncResult),
    Fail(ProviderError),
    Panic(&'static str),
    /// Sleeps, then returns an empty event set.
    Slow(Duration),
}

impl Script {
    pub fn events(events: Vec<FetchedEvent>) -> Self {
        Script::Events(ProviderSyncResult {
            events,
            next_cursor: None,
        })
    }

    pub fn events_with_cursor(events: Vec<FetchedEvent>, cursor: &str) -> Self {
        Script::Events(ProviderSyncResult {
            events,
            next_cursor: Some(cursor.to_string()),
        })
    }
}

/// Provider returning a per-calendar script; unscripted calendars get no events.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, Script>>,
    cursors: Mutex<HashMap<String, Vec<Option<String>>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, calendar_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(calendar_id.to_string(), script);
    }

    pub fn calls(&self, calendar_id: &str) -> usize {
        self.cursors(calendar_id).len()
    }

    pub fn cursors(&self, calendar_id: &str) -> Vec<Option<String>> {
        self.cursors
            .lock()
            .unwrap()
            .get(calendar_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.cursors.lock().unwrap().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl CalendarProvider for ScriptedProvider {
    async fn sync(
        &self,
        calendar: &Calendar,
        _credentials: &str,
        cursor: Option<&str>,
    ) -> Result<ProviderSyncResult, ProviderError> {
        self.cursors
            .lock()
            .unwrap()
            .entry(calendar.id.clone())
            .or_default()
            .push(cursor.map(str::to_string));

        let script = self.scripts.lock().unwrap().get(&calendar.id).cloned();
        match script {
            None => Ok(ProviderSyncResult::default()),
            Some(Script::Events(result)) => Ok(result),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Panic(msg)) => panic!("{}", msg),
            Some(Script::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(ProviderSyncResult::default())
            }
        }
    }
}

// =============================================================================
// Recording Notifier
// =============================================================================

/// Records `(calendar_id, external ids)` of every update.
#[derive(Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn updates(&self) -> Vec<(String, Vec<String>)> {
        self.updates.lock().unwrap().clone()
    }
}

impl UpdateNotifier for RecordingNotifier {
    fn notify_calendar_update(&self, calendar_id: &str, events: &[CalendarEvent]) {
        self.updates.lock().unwrap().push((
            calendar_id.to_string(),
            events.iter().map(|e| e.external_id.clone()).collect(),
        ));
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Sink that keeps every frame written to it.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<PushFrame>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<PushFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Parsed JSON of every `Message` frame.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                PushFrame::Message(json) => Some(serde_json::from_str(&json).unwrap()),
                PushFrame::KeepAlive => None,
            })
            .collect()
    }
}

impl PushSink for RecordingSink {
    fn write_frame(&self, frame: &PushFrame) -> Result<(), SinkClosed> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Sink whose every write fails.
#[derive(Default)]
pub struct FailingSink;

impl PushSink for FailingSink {
    fn write_frame(&self, _frame: &PushFrame) -> Result<(), SinkClosed> {
        Err(SinkClosed)
    }
}
