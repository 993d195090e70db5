//! Append-only audit events for the escrow recovery engine.
//!
//! Every security-relevant or state-changing action in the engine (error
//! detection, recovery decisions, rollbacks, access checks, session events)
//! is reported as an [`AuditEvent`]. Delivery is fire-and-forget: a failing
//! channel is logged and never propagates back into the caller.
//!
//! # Usage
//!
//! ```no_run
//! use audit::{AuditEvent, AuditLog, AuditSink};
//!
//! # async fn run() {
//! let audit = AuditLog::from_env();
//! audit.log_event(
//!     AuditEvent::new("ERROR_DETECTED", "Transaction error detected")
//!         .with("transaction_id", "tx-42"),
//! );
//! # }
//! ```
//!
//! # Configuration
//!
//! - `AUDIT_DISABLED`: Set to "true" to drop all events
//! - `AUDIT_WEBHOOK_URL`: Collector URL (enables the webhook channel)
//! - `AUDIT_TRAIL_CAPACITY`: Number of events kept in the in-memory trail
//!
//! # Architecture
//!
//! - [`AuditChannel`] trait defines a delivery destination
//! - [`AuditSink`] is the seam the engine depends on
//! - [`AuditLog`] keeps a synchronous in-memory trail and dispatches to all
//!   enabled channels on the tokio runtime

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::logging::LogChannel;
pub use channels::memory::{MemoryChannel, DEFAULT_TRAIL_CAPACITY};
pub use channels::webhook::WebhookChannel;
pub use channels::AuditChannel;
pub use error::ChannelError;
pub use events::AuditEvent;

use std::sync::Arc;
use tracing::{debug, error, info};

/// Environment variable to disable audit delivery.
const ENV_AUDIT_DISABLED: &str = "AUDIT_DISABLED";

/// Environment variable for the in-memory trail size.
const ENV_AUDIT_TRAIL_CAPACITY: &str = "AUDIT_TRAIL_CAPACITY";

/// Receiver of audit events. Implementations must never fail the caller.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn log_event(&self, event: AuditEvent);
}

/// Central audit dispatcher.
///
/// Events are appended to a bounded in-memory trail before `log_event`
/// returns, then delivered to every enabled channel in background tasks.
pub struct AuditLog {
    channels: Vec<Arc<dyn AuditChannel>>,
    trail: Arc<MemoryChannel>,
    disabled: bool,
}

impl AuditLog {
    /// Create an audit log from environment variables.
    ///
    /// The `tracing` mirror is always enabled; the webhook channel is added
    /// when `AUDIT_WEBHOOK_URL` is set.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_AUDIT_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        let capacity = std::env::var(ENV_AUDIT_TRAIL_CAPACITY)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRAIL_CAPACITY);

        if disabled {
            info!("Audit delivery disabled via AUDIT_DISABLED");
            return Self {
                channels: vec![],
                trail: Arc::new(MemoryChannel::new(capacity)),
                disabled: true,
            };
        }

        let mut channels: Vec<Arc<dyn AuditChannel>> = vec![Arc::new(LogChannel)];

        let webhook = WebhookChannel::from_env();
        if webhook.enabled() {
            info!("Audit webhook channel enabled");
            channels.push(Arc::new(webhook));
        }

        info!(
            channel_count = channels.len(),
            trail_capacity = capacity,
            "Audit log initialized"
        );

        Self {
            channels,
            trail: Arc::new(MemoryChannel::new(capacity)),
            disabled: false,
        }
    }

    /// Create an audit log with specific channels and a default-sized trail.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn AuditChannel>>) -> Self {
        Self {
            channels,
            trail: Arc::new(MemoryChannel::default()),
            disabled: false,
        }
    }

    /// Create an audit log that only keeps the in-memory trail.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_channels(vec![])
    }

    /// Create a disabled audit log.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: vec![],
            trail: Arc::new(MemoryChannel::new(1)),
            disabled: true,
        }
    }

    /// The in-memory trail of recent events.
    #[must_use]
    pub fn trail(&self) -> &MemoryChannel {
        &self.trail
    }

    /// Number of delivery channels (excluding the trail).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Deliver an event to every channel and wait for the results.
    pub async fn log_and_wait(&self, event: AuditEvent) -> Vec<(String, Result<(), ChannelError>)> {
        if self.disabled {
            return vec![];
        }
        self.trail.record(event.clone());

        let mut results = vec![];
        for channel in self.channels.iter().filter(|c| c.enabled()) {
            let result = channel.send(&event).await;
            results.push((channel.name().to_string(), result));
        }
        results
    }

    fn dispatch(&self, event: AuditEvent) {
        if self.channels.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                event_type = %event.event_type,
                "No async runtime, audit event kept in trail only"
            );
            return;
        };

        let event = Arc::new(event);
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);

            runtime.spawn(async move {
                let channel_name = channel.name();

                if !channel.enabled() {
                    debug!(channel = channel_name, "Channel disabled, skipping");
                    return;
                }

                if let Err(e) = channel.send(&event).await {
                    error!(
                        channel = channel_name,
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to deliver audit event"
                    );
                }
            });
        }
    }
}

impl AuditSink for AuditLog {
    fn log_event(&self, event: AuditEvent) {
        if self.disabled {
            return;
        }
        self.trail.record(event.clone());
        self.dispatch(event);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::from_env()
    }
}
