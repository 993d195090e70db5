//! Engine configuration.
//!
//! All timing constants live here so the monitor, the orchestrator and the
//! verification pipeline share one retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Retry/backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(30)).unwrap_or(30);
        let multiplier = self.backoff_multiplier.max(1.0).powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry given the current attempt count.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Continuous monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between polls of a still-pending transaction.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Verification pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Wall-clock limit for one verification run.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Number of stages run concurrently by the batched variant.
    pub batch_size: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            batch_size: 5,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Wait applied by the wait-and-retry strategy.
    #[serde(with = "duration_ms")]
    pub network_retry_delay: Duration,

    /// Shared retry policy (wallet reconnection, monitor transient failures).
    pub retry: RetryConfig,

    /// Monitor settings.
    pub monitor: MonitorConfig,

    /// Per-call timeout applied to every ledger request.
    #[serde(with = "duration_ms")]
    pub ledger_call_timeout: Duration,

    /// Verification settings.
    pub verification: VerificationConfig,

    /// Idle timeout for admin sessions.
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,

    /// Rolling window used for pattern analysis.
    #[serde(with = "duration_ms")]
    pub pattern_window: Duration,

    /// Ledger latency above which a transaction is considered congested.
    #[serde(with = "duration_ms")]
    pub congestion_latency_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network_retry_delay: Duration::from_secs(5),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            ledger_call_timeout: Duration::from_secs(10),
            verification: VerificationConfig::default(),
            session_timeout: Duration::from_secs(30 * 60),
            pattern_window: Duration::from_secs(60 * 60),
            congestion_latency_threshold: Duration::from_secs(10),
        }
    }
}

impl RecoveryConfig {
    /// Build the default configuration overlaid with `RECOVERY_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    /// Apply `RECOVERY_*` environment overrides on top of `self`.
    #[must_use]
    pub fn overlay_env(mut self) -> Self {
        if let Some(ms) = env_u64("RECOVERY_NETWORK_RETRY_DELAY_MS") {
            self.network_retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RECOVERY_MAX_RETRY_ATTEMPTS") {
            self.retry.max_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(ms) = env_u64("RECOVERY_INITIAL_BACKOFF_MS") {
            self.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RECOVERY_MAX_BACKOFF_MS") {
            self.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RECOVERY_MONITOR_POLL_MS") {
            self.monitor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RECOVERY_LEDGER_TIMEOUT_MS") {
            self.ledger_call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RECOVERY_VERIFICATION_TIMEOUT_MS") {
            self.verification.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RECOVERY_VERIFICATION_BATCH_SIZE") {
            self.verification.batch_size = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(secs) = env_u64("RECOVERY_SESSION_TIMEOUT_SECS") {
            self.session_timeout = Duration::from_secs(secs);
        }
        if let Some(mins) = env_u64("RECOVERY_PATTERN_WINDOW_MINS") {
            self.pattern_window = Duration::from_secs(mins * 60);
        }
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "retry.initial_delay must not exceed retry.max_delay",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.verification.batch_size == 0 {
            return Err(config_error("verification.batch_size must be at least 1"));
        }
        if self.ledger_call_timeout.is_zero() || self.verification.timeout.is_zero() {
            return Err(config_error("timeouts must be non-zero"));
        }
        if self.session_timeout.is_zero() || self.pattern_window.is_zero() {
            return Err(config_error(
                "session_timeout and pattern_window must be non-zero",
            ));
        }
        Ok(())
    }
}

fn config_error(details: &str) -> EngineError {
    EngineError::Configuration {
        details: details.to_string(),
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Serialize durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
