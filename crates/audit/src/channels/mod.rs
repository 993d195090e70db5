//! Audit channel implementations.

pub mod logging;
pub mod memory;
pub mod webhook;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::AuditEvent;

/// A destination for audit events (log stream, in-memory trail, collector).
#[async_trait]
pub trait AuditChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Deliver one event.
    async fn send(&self, event: &AuditEvent) -> Result<(), ChannelError>;
}
