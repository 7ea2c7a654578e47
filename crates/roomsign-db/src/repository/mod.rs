//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.calendars()                                                        │
//! │  ├── recover_stale(threshold, now)     bulk conditional UPDATE         │
//! │  ├── select_due(now, limit)            dispatcher selection            │
//! │  ├── try_acquire(id, token, now)       lock: !SYNCING → SYNCING        │
//! │  ├── complete_success(..)              token-guarded, replaces events  │
//! │  └── complete_failure(..)              token-guarded                   │
//! │                                                                         │
//! │  db.events()                                                           │
//! │  ├── list_for_calendar(id)                                             │
//! │  └── list_for_calendars(ids)                                           │
//! │                                                                         │
//! │  db.displays()                                                         │
//! │  ├── get(id)                           with ordered calendar ids       │
//! │  └── update_config(id, config)                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod calendar;
pub mod display;
pub mod event;
