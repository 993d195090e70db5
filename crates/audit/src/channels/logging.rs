//! Mirrors audit events into the `tracing` stream.

use async_trait::async_trait;
use tracing::info;

use crate::error::ChannelError;
use crate::events::AuditEvent;
use crate::AuditChannel;

/// Emits every audit event as a structured `tracing` record at target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl AuditChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &AuditEvent) -> Result<(), ChannelError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        info!(
            target: "audit",
            event_type = %event.event_type,
            metadata = %metadata,
            "{}",
            event.message
        );
        Ok(())
    }
}
