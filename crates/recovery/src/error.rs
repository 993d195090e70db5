use thiserror::Error;

use crate::ledger::LedgerError;

/// Errors surfaced by engine operations.
///
/// Business outcomes (a recovery ending in manual intervention, a failed
/// verification) are reported through status values, not through this type.
/// `EngineError` covers collaborator failures, invalid requests and
/// authorization denials.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Ledger call failed
    #[error("Ledger operation '{operation}' failed: {source}")]
    Ledger {
        operation: String,
        #[source]
        source: LedgerError,
    },

    /// Admin lacks the permissions required for an operation
    #[error("Admin '{admin_id}' is not authorized to perform {operation}")]
    Unauthorized { admin_id: String, operation: String },

    /// Session is missing, expired or does not match the token
    #[error("Session for admin '{admin_id}' is invalid or expired")]
    SessionInvalid { admin_id: String },

    /// Unknown admin
    #[error("Admin '{admin_id}' does not exist")]
    UnknownAdmin { admin_id: String },

    /// Ticket id does not exist
    #[error("Intervention ticket '{ticket_id}' not found")]
    TicketNotFound { ticket_id: String },

    /// Ticket already approved or rejected
    #[error("Intervention ticket '{ticket_id}' is already {status}")]
    TicketNotPending { ticket_id: String, status: String },

    /// State machine transition rejected
    #[error("Invalid state transition for '{transaction_id}': {from} -> {to}")]
    InvalidTransition {
        transaction_id: String,
        from: String,
        to: String,
    },

    /// No recovery run with this error id
    #[error("Error {error_id} not found in active recoveries")]
    RecoveryNotFound { error_id: String },

    /// No classified error for this transaction
    #[error("No classified error recorded for transaction '{transaction_id}'")]
    ErrorNotFound { transaction_id: String },

    /// A rollback is already running for this transaction
    #[error("Rollback already in progress for transaction '{transaction_id}'")]
    RollbackInProgress { transaction_id: String },

    /// Work was cancelled cooperatively
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Background task panicked or was aborted
    #[error("Task failed: {details}")]
    Task { details: String },

    /// Invalid configuration
    #[error("Configuration error: {details}")]
    Configuration { details: String },
}

/// Type alias for engine results
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Wrap a ledger failure with the operation that produced it.
    pub fn ledger(operation: impl Into<String>, source: LedgerError) -> Self {
        Self::Ledger {
            operation: operation.into(),
            source,
        }
    }

    /// Check if error indicates an authorization failure
    #[must_use]
    pub fn is_authorization_error(&self) -> bool {
        matches!(
            self,
            EngineError::Unauthorized { .. }
                | EngineError::SessionInvalid { .. }
                | EngineError::UnknownAdmin { .. }
        )
    }

    /// Check if error is transient (can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Ledger { source, .. } => source.is_transient(),
            EngineError::RollbackInProgress { .. } => true,
            _ => false,
        }
    }

    /// Get error category for logging
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Ledger { .. } => "ledger",
            EngineError::Unauthorized { .. }
            | EngineError::SessionInvalid { .. }
            | EngineError::UnknownAdmin { .. } => "authorization",
            EngineError::TicketNotFound { .. } | EngineError::TicketNotPending { .. } => {
                "intervention"
            }
            EngineError::InvalidTransition { .. } => "state",
            EngineError::RecoveryNotFound { .. }
            | EngineError::ErrorNotFound { .. }
            | EngineError::RollbackInProgress { .. } => "recovery",
            EngineError::Cancelled { .. } | EngineError::Task { .. } => "task",
            EngineError::Configuration { .. } => "configuration",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(source: LedgerError) -> Self {
        let operation = match &source {
            LedgerError::Timeout { operation } => operation.clone(),
            _ => "ledger".to_string(),
        };
        EngineError::Ledger { operation, source }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let unauthorized = EngineError::Unauthorized {
            admin_id: "agent-1".to_string(),
            operation: "MANUAL_INTERVENTION".to_string(),
        };
        assert!(unauthorized.is_authorization_error());
        assert!(!unauthorized.is_recoverable());
        assert_eq!(unauthorized.category(), "authorization");

        let timeout = EngineError::ledger(
            "get_transaction",
            LedgerError::Timeout {
                operation: "get_transaction".to_string(),
            },
        );
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.category(), "ledger");

        let rejected = EngineError::ledger(
            "submit_transaction",
            LedgerError::Rejected {
                reason: "tx_bad_seq".to_string(),
            },
        );
        assert!(!rejected.is_recoverable());
    }

    #[test]
    fn test_not_found_message() {
        let err = EngineError::RecoveryNotFound {
            error_id: "err-1".to_string(),
        };
        assert_eq!(err.to_string(), "Error err-1 not found in active recoveries");
    }
}
