//! # Push Envelope
//!
//! JSON messages streamed to kiosk displays, one object per frame.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  connect        {"type":"init","displayId":..,"config":..,       │
//! │                  "events":[..]}                                  │
//! │  sync changed   {"type":"calendar_update","calendarId":..,       │
//! │                  "events":[..]}                                  │
//! │  admin edit     {"type":"config_update","config":..}             │
//! │  every 30s      ": \n\n"  (comment frame, not a PushMessage)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Kiosks replace their whole event list on `calendar_update`, so a
//! duplicated update is harmless.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::CalendarEvent;

/// A message pushed to a display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum PushMessage {
    /// First frame of every connection.
    Init(InitPayload),
    /// Events of one calendar changed.
    CalendarUpdate(CalendarUpdatePayload),
    /// The display's configuration changed.
    ConfigUpdate(ConfigUpdatePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InitPayload {
    pub display_id: String,
    pub config: serde_json::Value,
    pub events: Vec<CalendarEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CalendarUpdatePayload {
    pub calendar_id: String,
    pub events: Vec<CalendarEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConfigUpdatePayload {
    pub config: serde_json::Value,
}

impl PushMessage {
    pub fn init(
        display_id: impl Into<String>,
        config: serde_json::Value,
        events: Vec<CalendarEvent>,
    ) -> Self {
        PushMessage::Init(InitPayload {
            display_id: display_id.into(),
            config,
            events,
        })
    }

    pub fn calendar_update(calendar_id: impl Into<String>, events: Vec<CalendarEvent>) -> Self {
        PushMessage::CalendarUpdate(CalendarUpdatePayload {
            calendar_id: calendar_id.into(),
            events,
        })
    }

    pub fn config_update(config: serde_json::Value) -> Self {
        PushMessage::ConfigUpdate(ConfigUpdatePayload { config })
    }

    /// Wire name of the message, as found in its `type` field.
    pub const fn kind(&self) -> &'static str {
        match self {
            PushMessage::Init(_) => "init",
            PushMessage::CalendarUpdate(_) => "calendar_update",
            PushMessage::ConfigUpdate(_) => "config_update",
        }
    }

    /// Serializes to the single-line JSON carried in one frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
