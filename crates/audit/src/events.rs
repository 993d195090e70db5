//! Audit event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single append-only audit record.
///
/// `event_type` is an upper snake case tag such as `ERROR_DETECTED` or
/// `ACCESS_DENIED`. Metadata keys are sorted so serialized events are stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event type tag
    pub event_type: String,

    /// Human readable description
    pub message: String,

    /// Structured context (transaction id, admin id, reason, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// When the event was recorded
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach one metadata entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Attach a batch of metadata entries.
    #[must_use]
    pub fn with_all<K, V, I>(mut self, entries: I) -> Self
    where
        K: Into<String>,
        V: ToString,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.metadata.insert(key.into(), value.to_string());
        }
        self
    }

    /// Look up a metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            self.event_type,
            self.message
        )
    }
}
