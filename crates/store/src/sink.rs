//! Store-backed security event sink.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use vigil_common::{SecurityEvent, SecurityEventSink};

use crate::CredentialStore;

/// Default key for the event list.
const DEFAULT_EVENT_KEY: &str = "events:security";

/// Default number of retained events.
const DEFAULT_MAX_EVENTS: i64 = 10_000;

/// Event sink that appends to a capped list in the credential store.
///
/// Write-only from the services' point of view: append failures are
/// logged and swallowed, never surfaced to the emitting operation.
pub struct StoreEventSink {
    store: Arc<dyn CredentialStore>,
    key: String,
    max_events: i64,
}

impl StoreEventSink {
    /// Create a sink with default retention.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            key: DEFAULT_EVENT_KEY.to_string(),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    /// Create a sink with a custom list key and retention cap.
    #[must_use]
    pub fn with_settings(store: Arc<dyn CredentialStore>, key: &str, max_events: i64) -> Self {
        Self {
            store,
            key: key.to_string(),
            max_events,
        }
    }

    /// Read back the most recent events, newest first.
    pub async fn recent(&self, count: i64) -> Vec<SecurityEvent> {
        let raw = match self.store.list_range(&self.key, 0, count - 1).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "Failed to read security events");
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect()
    }
}

#[async_trait]
impl SecurityEventSink for StoreEventSink {
    async fn append(&self, event: SecurityEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                warn!(category = %event.category, error = %err, "Failed to serialize security event");
                return;
            }
        };

        if let Err(err) = self.store.list_push(&self.key, &json).await {
            warn!(category = %event.category, error = %err, "Failed to append security event");
            return;
        }

        if let Err(err) = self.store.list_trim(&self.key, 0, self.max_events - 1).await {
            warn!(error = %err, "Failed to trim security event log");
        }
    }
}
