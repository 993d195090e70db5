//! Closed taxonomy of transaction failures.
//!
//! Every failure the engine handles is a [`TransactionError`]: common fields
//! plus one [`ErrorKind`] variant carrying the type-specific details.
//! Matches over `ErrorKind` are exhaustive throughout the crate, so adding a
//! variant forces every component to decide how to handle it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ledger::Amount;

/// Severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used by risk scoring.
    #[must_use]
    pub const fn score(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Congestion level derived from ledger latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl CongestionLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Extreme => "EXTREME",
        }
    }
}

/// Type-specific details of a [`TransactionError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Ledger too slow or the transaction expired before inclusion
    NetworkCongestion {
        congestion_level: CongestionLevel,
        /// Suggested wait before resubmitting, in seconds
        retry_after_secs: u64,
    },

    /// Source account cannot cover amount plus fees
    InsufficientFunds {
        required: Amount,
        available: Amount,
        currency: String,
    },

    /// Contract invocation failed
    SmartContractFailure {
        contract_address: String,
        error_code: String,
        function_name: String,
    },

    /// Wallet session dropped mid-transaction
    WalletConnectionLost {
        last_connected_at: Option<DateTime<Utc>>,
        attempts: u32,
    },

    /// Escrow account in an invalid state or missing signatures
    EscrowVerificationFailed {
        escrow_address: String,
        missing_signatures: u32,
    },

    /// Sequence number desync between the transaction and its source account
    SystemSynchronization { current_seq: i64, tx_seq: i64 },

    /// Failed on the ledger without a more specific classification
    Blockchain { result_code: String },

    /// Ledger kept timing out while the transaction was being watched
    Timeout { operation: String, timeout_ms: u64 },

    /// Anything else, including failures of the classifier itself
    Unknown { stack_trace: Option<String> },
}

impl ErrorKind {
    /// Stable name used in audit metadata, pattern grouping and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NetworkCongestion { .. } => "NetworkCongestion",
            Self::InsufficientFunds { .. } => "InsufficientFunds",
            Self::SmartContractFailure { .. } => "SmartContractFailure",
            Self::WalletConnectionLost { .. } => "WalletConnectionLost",
            Self::EscrowVerificationFailed { .. } => "EscrowVerificationFailed",
            Self::SystemSynchronization { .. } => "SystemSynchronization",
            Self::Blockchain { .. } => "Blockchain",
            Self::Timeout { .. } => "Timeout",
            Self::Unknown { .. } => "Unknown",
        }
    }
}

/// A classified transaction failure. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionError {
    /// Unique id of this error instance
    pub id: String,

    /// Ledger transaction the error belongs to
    pub transaction_id: String,

    /// Human readable description
    pub message: String,

    /// When the error was observed
    pub timestamp: DateTime<Utc>,

    /// Severity
    pub severity: Severity,

    /// Whether automated recovery may be attempted
    pub recoverable: bool,

    /// Type-specific details
    pub kind: ErrorKind,
}

impl TransactionError {
    /// Create an error with a fresh id and the current timestamp.
    pub fn new(
        transaction_id: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
        recoverable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            recoverable,
            kind,
        }
    }

    /// Congestion error with the standard message.
    pub fn network_congestion(
        transaction_id: impl Into<String>,
        congestion_level: CongestionLevel,
        retry_after_secs: u64,
    ) -> Self {
        let severity = match congestion_level {
            CongestionLevel::Low => Severity::Low,
            CongestionLevel::Medium => Severity::Medium,
            CongestionLevel::High | CongestionLevel::Extreme => Severity::High,
        };
        Self::new(
            transaction_id,
            ErrorKind::NetworkCongestion {
                congestion_level,
                retry_after_secs,
            },
            severity,
            true,
            format!("Network congestion detected. Retry after {retry_after_secs} seconds"),
        )
    }

    pub fn insufficient_funds(
        transaction_id: impl Into<String>,
        required: Amount,
        available: Amount,
        currency: &str,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::InsufficientFunds {
                required,
                available,
                currency: currency.to_string(),
            },
            Severity::High,
            false,
            format!(
                "Insufficient funds for transaction. Required: {required} {currency}, Available: {available} {currency}"
            ),
        )
    }

    pub fn smart_contract_failure(
        transaction_id: impl Into<String>,
        contract_address: &str,
        error_code: &str,
        function_name: &str,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::SmartContractFailure {
                contract_address: contract_address.to_string(),
                error_code: error_code.to_string(),
                function_name: function_name.to_string(),
            },
            Severity::High,
            false,
            format!("Smart contract execution failed: {error_code} in {function_name}"),
        )
    }

    pub fn wallet_connection_lost(
        transaction_id: impl Into<String>,
        last_connected_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::WalletConnectionLost {
                last_connected_at,
                attempts: 0,
            },
            Severity::Medium,
            true,
            "Wallet connection lost during transaction",
        )
    }

    pub fn escrow_verification_failed(
        transaction_id: impl Into<String>,
        escrow_address: &str,
        missing_signatures: u32,
        error_code: &str,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::EscrowVerificationFailed {
                escrow_address: escrow_address.to_string(),
                missing_signatures,
            },
            Severity::High,
            true,
            format!("Escrow verification failed: {error_code}"),
        )
    }

    pub fn system_synchronization(
        transaction_id: impl Into<String>,
        current_seq: i64,
        tx_seq: i64,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::SystemSynchronization {
                current_seq,
                tx_seq,
            },
            Severity::Medium,
            true,
            format!("Sequence number out of sync: account at {current_seq}, transaction used {tx_seq}"),
        )
    }

    pub fn blockchain(transaction_id: impl Into<String>, result_code: &str) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::Blockchain {
                result_code: result_code.to_string(),
            },
            Severity::High,
            true,
            format!("Transaction failed on ledger: {result_code}"),
        )
    }

    pub fn timeout(transaction_id: impl Into<String>, operation: &str, timeout_ms: u64) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            },
            Severity::High,
            true,
            format!("Operation {operation} timed out after {timeout_ms}ms"),
        )
    }

    pub fn unknown(
        transaction_id: impl Into<String>,
        message: impl Into<String>,
        stack_trace: Option<String>,
    ) -> Self {
        Self::new(
            transaction_id,
            ErrorKind::Unknown { stack_trace },
            Severity::High,
            false,
            message,
        )
    }

    /// Override the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Stable type name of the error.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] on {}: {}",
            self.kind_name(),
            self.severity,
            self.transaction_id,
            self.message
        )
    }
}
