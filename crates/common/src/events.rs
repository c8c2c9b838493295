//! Security event log types and sinks.
//!
//! Every security service emits a structured [`SecurityEvent`] per
//! operation. Sinks are write-only and fire-and-forget: a sink failure
//! must never fail the security operation that emitted the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::id::IdGenerator;

/// An append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// Unique event ID.
    pub id: String,
    /// Event category (e.g. `permission_check`, `login_risk`).
    pub category: String,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(category: &str, payload: serde_json::Value) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            category: category.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for security events.
///
/// Implementations swallow their own failures; `append` is infallible
/// from the caller's point of view.
#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    /// Append an event to the log.
    async fn append(&self, event: SecurityEvent);
}

/// Sink that writes events as structured log lines.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

#[async_trait]
impl SecurityEventSink for TracingEventSink {
    async fn append(&self, event: SecurityEvent) {
        tracing::info!(
            event_id = %event.id,
            category = %event.category,
            payload = %event.payload,
            "security event"
        );
    }
}

/// Sink that collects events in memory.
///
/// Useful for asserting on emitted events in tests.
#[derive(Debug, Default)]
pub struct CapturingEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl CapturingEventSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Captured events in the given category.
    #[must_use]
    pub fn events_in(&self, category: &str) -> Vec<SecurityEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }
}

#[async_trait]
impl SecurityEventSink for CapturingEventSink {
    async fn append(&self, event: SecurityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
