//! Error types for audit delivery.

use thiserror::Error;

/// Errors that can occur when delivering an audit event to a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collector rejected the event
    #[error("Collector returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Other error
    #[error("{0}")]
    Other(String),
}
