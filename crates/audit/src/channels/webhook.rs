//! JSON webhook audit channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::AuditEvent;
use crate::AuditChannel;

/// Environment variable for the audit collector URL.
const ENV_AUDIT_WEBHOOK_URL: &str = "AUDIT_WEBHOOK_URL";

/// Source tag attached to every payload.
const SOURCE: &str = "escrow-recovery";

/// Posts each audit event as JSON to an external collector.
pub struct WebhookChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_AUDIT_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Audit webhook enabled");
        } else {
            debug!("Audit webhook disabled (AUDIT_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook channel with a specific collector URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(event: &AuditEvent) -> WebhookPayload<'_> {
        WebhookPayload {
            source: SOURCE,
            event_type: &event.event_type,
            message: &event.message,
            metadata: &event.metadata,
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

#[async_trait]
impl AuditChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &AuditEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_AUDIT_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "webhook", event_type = %event.event_type, "Sending audit event");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "webhook",
                status = %status,
                body = %body,
                "Audit collector rejected event"
            );

            Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    source: &'static str,
    event_type: &'a str,
    message: &'a str,
    metadata: &'a std::collections::BTreeMap<String, String>,
    timestamp: String,
}
