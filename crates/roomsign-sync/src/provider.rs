//! # Calendar Provider Capability
//!
//! The sync engine never speaks ICS, CalDAV, EWS or the Google API itself.
//! Each protocol lives behind [`CalendarProvider`], looked up per
//! [`ProviderKind`] in a [`ProviderRegistry`].
//!
//! ```text
//! SyncRunner ──► ProviderRegistry::get(calendar.provider)
//!                     │
//!                     ├── EXCHANGE ─► Arc<dyn CalendarProvider>
//!                     ├── GOOGLE   ─► Arc<dyn CalendarProvider>
//!                     └── (missing) ─► ProviderError::Unsupported
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use roomsign_core::{Calendar, FetchedEvent, ProviderKind};

use crate::error::ProviderError;

/// What one provider call returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSyncResult {
    /// The complete current event set of the calendar, in any order.
    pub events: Vec<FetchedEvent>,
    /// Opaque cursor to hand back on the next call.
    pub next_cursor: Option<String>,
}

/// Fetches the events of one external calendar.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Returns the calendar's current events.
    ///
    /// ## Arguments
    /// * `calendar` - Row being synced (id, name, provider kind)
    /// * `credentials` - Opaque JSON credentials stored with the calendar
    /// * `cursor` - `next_cursor` of the previous successful call, if any
    async fn sync(
        &self,
        calendar: &Calendar,
        credentials: &str,
        cursor: Option<&str>,
    ) -> Result<ProviderSyncResult, ProviderError>;
}

/// Provider implementations keyed by kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CalendarProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: ProviderKind, provider: Arc<dyn CalendarProvider>) -> Self {
        self.register(kind, provider);
        self
    }

    /// Registers (or replaces) the provider for `kind`.
    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn CalendarProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Looks up the provider for `kind`.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn CalendarProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported(format!("No provider registered for {kind}")))
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
