//! Bounded in-memory audit trail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::ChannelError;
use crate::events::AuditEvent;
use crate::AuditChannel;

/// Default number of events retained by [`MemoryChannel`].
pub const DEFAULT_TRAIL_CAPACITY: usize = 1024;

/// Keeps the most recent events in memory, oldest evicted first.
#[derive(Debug)]
pub struct MemoryChannel {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryChannel {
    /// Create a trail holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an event synchronously.
    pub fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of all retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Retained events with the given type tag.
    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether the trail is empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_TRAIL_CAPACITY)
    }
}

#[async_trait]
impl AuditChannel for MemoryChannel {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &AuditEvent) -> Result<(), ChannelError> {
        self.record(event.clone());
        Ok(())
    }
}
