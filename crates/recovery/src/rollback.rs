//! Compensating actions for failed transactions.
//!
//! Each error type maps to one compensation: a refund from the destination
//! back to the source, a partial refund, an escrow release, a contract
//! reversal, or a hand-off to manual review. Runs are tracked per
//! transaction and at most one may be active at a time.

use audit::{AuditEvent, AuditSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::ledger::{
    call_with_timeout, Amount, LedgerClient, LedgerError, LedgerTransaction, WalletConnectivity,
};
use crate::store::{ObservableStore, Snapshot};
use crate::taxonomy::{ErrorKind, TransactionError};

/// Share of the amount refunded after a congestion failure (0.1% retained).
const PARTIAL_REFUND_NUMERATOR: i64 = 999;
const PARTIAL_REFUND_DENOMINATOR: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RollbackState {
    Analyzing,
    InProgress { stage: String, progress: u8 },
    Completed { refund_tx_id: String },
    Failed { reason: String },
    RequiresManualIntervention { reason: String, action: String },
}

impl RollbackState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Analyzing | Self::InProgress { .. })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Analyzing => "Analyzing",
            Self::InProgress { .. } => "InProgress",
            Self::Completed { .. } => "Completed",
            Self::Failed { .. } => "Failed",
            Self::RequiresManualIntervention { .. } => "RequiresManualIntervention",
        }
    }

    fn manual(reason: &str, action: &str) -> Self {
        Self::RequiresManualIntervention {
            reason: reason.to_string(),
            action: action.to_string(),
        }
    }
}

/// Outcome of claiming a transaction's rollback slot.
enum Claim {
    Claimed,
    Busy,
    Done(RollbackState),
}

/// Compensating transfer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compensation {
    Refund,
    PartialRefund,
    EscrowRelease,
    ContractReversal,
}

impl Compensation {
    const fn stage(self) -> &'static str {
        match self {
            Self::Refund => "Initiating refund",
            Self::PartialRefund => "Processing partial refund",
            Self::EscrowRelease => "Releasing escrow",
            Self::ContractReversal => "Reversing smart contract",
        }
    }

    const fn audit_event(self) -> &'static str {
        match self {
            Self::Refund => "REFUND_COMPLETED",
            Self::PartialRefund => "PARTIAL_REFUND_COMPLETED",
            Self::EscrowRelease => "ESCROW_RELEASED",
            Self::ContractReversal => "CONTRACT_REVERSED",
        }
    }
}

/// Rollback engine with an observable per-transaction run map.
pub struct RollbackEngine {
    ledger: Arc<dyn LedgerClient>,
    wallet: Arc<dyn WalletConnectivity>,
    audit: Arc<dyn AuditSink>,
    runs: ObservableStore<String, RollbackState>,
    call_timeout: Duration,
}

impl RollbackEngine {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletConnectivity>,
        audit: Arc<dyn AuditSink>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            wallet,
            audit,
            runs: ObservableStore::new(),
            call_timeout,
        }
    }

    /// Roll back `transaction_id` according to the type of `error`.
    ///
    /// Returns the terminal rollback state. Ledger failures are recorded as
    /// `Failed` and returned as errors. `Completed` is absorbing: a later call
    /// returns the stored state without submitting another compensation.
    /// `Failed` and `RequiresManualIntervention` moved no funds and may be
    /// retried.
    pub async fn initiate_rollback(
        &self,
        transaction_id: &str,
        error: &TransactionError,
    ) -> EngineResult<RollbackState> {
        let key = transaction_id.to_string();
        let claim = self.runs.update(|runs| match runs.get(&key) {
            Some(state) if state.is_active() => Claim::Busy,
            Some(state @ RollbackState::Completed { .. }) => Claim::Done(state.clone()),
            _ => {
                runs.insert(key.clone(), RollbackState::Analyzing);
                Claim::Claimed
            }
        });
        match claim {
            Claim::Claimed => {}
            Claim::Busy => {
                warn!(transaction_id, "Rollback already in progress");
                return Err(EngineError::RollbackInProgress {
                    transaction_id: transaction_id.to_string(),
                });
            }
            Claim::Done(state) => {
                info!(transaction_id, "Rollback already completed");
                self.audit.log_event(
                    AuditEvent::new("ROLLBACK_ALREADY_COMPLETED", "Rollback already completed")
                        .with("transaction_id", transaction_id),
                );
                return Ok(state);
            }
        }

        info!(transaction_id, error_type = error.kind_name(), "Initiating rollback");
        self.audit.log_event(
            AuditEvent::new("ROLLBACK_INITIATED", "Initiating rollback")
                .with("transaction_id", transaction_id)
                .with("error_type", error.kind_name())
                .with("error_message", &error.message),
        );
        self.publish_state(transaction_id, &RollbackState::Analyzing);

        match self.dispatch(transaction_id, error).await {
            Ok(state) => {
                self.set_state(transaction_id, state.clone());
                Ok(state)
            }
            Err(e) => {
                error!(transaction_id, error = %e, "Rollback failed");
                self.audit.log_event(
                    AuditEvent::new("ROLLBACK_FAILED", "Rollback failed")
                        .with("transaction_id", transaction_id)
                        .with("error", &e),
                );
                self.set_state(
                    transaction_id,
                    RollbackState::Failed {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    pub fn state(&self, transaction_id: &str) -> Option<RollbackState> {
        self.runs.get(&transaction_id.to_string())
    }

    pub fn states(&self) -> Snapshot<String, RollbackState> {
        self.runs.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, RollbackState>> {
        self.runs.subscribe()
    }

    async fn dispatch(&self, transaction_id: &str, error: &TransactionError) -> EngineResult<RollbackState> {
        let tx = self.fetch(transaction_id).await?;

        match &error.kind {
            ErrorKind::InsufficientFunds { .. } => self.compensate(&tx, Compensation::Refund, None).await,
            ErrorKind::NetworkCongestion { .. } => {
                self.compensate(&tx, Compensation::PartialRefund, None).await
            }
            ErrorKind::EscrowVerificationFailed { escrow_address, .. } => {
                self.compensate(&tx, Compensation::EscrowRelease, Some(escrow_address.as_str()))
                    .await
            }
            ErrorKind::SmartContractFailure {
                contract_address, ..
            } => {
                self.compensate(&tx, Compensation::ContractReversal, Some(contract_address.as_str()))
                    .await
            }
            ErrorKind::WalletConnectionLost { .. } => {
                if self.wallet.is_connected().await {
                    self.compensate(&tx, Compensation::Refund, None).await
                } else {
                    Ok(RollbackState::manual(
                        "Wallet connection required for rollback",
                        "Please reconnect your wallet to complete the rollback",
                    ))
                }
            }
            ErrorKind::Blockchain { .. } | ErrorKind::SystemSynchronization { .. } => {
                self.set_state(
                    transaction_id,
                    RollbackState::InProgress {
                        stage: "Analyzing blockchain state".to_string(),
                        progress: 25,
                    },
                );
                let chain = call_with_timeout(
                    self.call_timeout,
                    "get_blockchain_state",
                    self.ledger.get_blockchain_state(),
                )
                .await
                .map_err(|e| EngineError::ledger("get_blockchain_state", e))?;
                if chain.is_healthy() {
                    self.compensate(&tx, Compensation::Refund, None).await
                } else {
                    Ok(RollbackState::manual(
                        "Blockchain instability detected",
                        "Please wait for network stability before retrying",
                    ))
                }
            }
            ErrorKind::Timeout { .. } => {
                self.set_state(
                    transaction_id,
                    RollbackState::InProgress {
                        stage: "Verifying transaction timeout".to_string(),
                        progress: 25,
                    },
                );
                let still_pending = self
                    .fetch(transaction_id)
                    .await
                    .is_ok_and(|current| current.is_pending());
                if still_pending {
                    self.compensate(&tx, Compensation::Refund, None).await
                } else {
                    Ok(RollbackState::manual(
                        "Transaction status unclear",
                        "Please verify transaction status before proceeding",
                    ))
                }
            }
            ErrorKind::Unknown { .. } => {
                self.audit.log_event(
                    AuditEvent::new("MANUAL_REVIEW_REQUIRED", "Unknown error requires manual review")
                        .with("transaction_id", transaction_id)
                        .with("source_account", &tx.source_account)
                        .with("destination_account", &tx.destination_account)
                        .with("amount", tx.amount),
                );
                Ok(RollbackState::manual(
                    "Unknown error requires manual review",
                    "Please contact support for assistance",
                ))
            }
        }
    }

    async fn fetch(&self, transaction_id: &str) -> EngineResult<LedgerTransaction> {
        call_with_timeout(
            self.call_timeout,
            "get_transaction",
            self.ledger.get_transaction(transaction_id),
        )
        .await
        .map_err(|e| EngineError::ledger("get_transaction", e))
    }

    async fn compensate(
        &self,
        tx: &LedgerTransaction,
        compensation: Compensation,
        target: Option<&str>,
    ) -> EngineResult<RollbackState> {
        self.set_state(
            &tx.id,
            RollbackState::InProgress {
                stage: compensation.stage().to_string(),
                progress: 50,
            },
        );

        let target = target.filter(|t| !t.is_empty() && *t != "unknown");
        let (operation, submitted) = match compensation {
            Compensation::Refund => (
                "submit_transaction",
                self.refund(tx, tx.amount, &format!("Refund for failed transaction: {}", tx.id))
                    .await,
            ),
            Compensation::PartialRefund => (
                "submit_transaction",
                self.refund(
                    tx,
                    tx.amount
                        .scaled(PARTIAL_REFUND_NUMERATOR, PARTIAL_REFUND_DENOMINATOR),
                    &format!("Partial refund (network congestion): {}", tx.id),
                )
                .await,
            ),
            Compensation::EscrowRelease => {
                let escrow = target
                    .or_else(|| tx.escrow_address())
                    .unwrap_or(tx.source_account.as_str());
                (
                    "release_escrow",
                    call_with_timeout(
                        self.call_timeout,
                        "release_escrow",
                        self.ledger
                            .release_escrow(escrow, &tx.destination_account, tx.amount),
                    )
                    .await,
                )
            }
            Compensation::ContractReversal => {
                let contract = target
                    .or_else(|| tx.contract_address())
                    .unwrap_or(tx.source_account.as_str());
                (
                    "reverse_contract",
                    call_with_timeout(
                        self.call_timeout,
                        "reverse_contract",
                        self.ledger.reverse_contract(contract, &tx.id),
                    )
                    .await,
                )
            }
        };

        let compensation_tx = submitted.map_err(|e| EngineError::ledger(operation, e))?;
        if compensation_tx.trim().is_empty() {
            return Err(EngineError::ledger(
                operation,
                LedgerError::InvalidResponse {
                    details: "empty transaction id".to_string(),
                },
            ));
        }

        info!(
            transaction_id = %tx.id,
            compensation_tx = %compensation_tx,
            "Compensation submitted"
        );
        self.audit.log_event(
            AuditEvent::new(compensation.audit_event(), "Compensating transaction completed")
                .with("transaction_id", &tx.id)
                .with("compensation_transaction", &compensation_tx),
        );
        Ok(RollbackState::Completed {
            refund_tx_id: compensation_tx,
        })
    }

    async fn refund(&self, tx: &LedgerTransaction, amount: Amount, memo: &str) -> Result<String, LedgerError> {
        call_with_timeout(
            self.call_timeout,
            "submit_transaction",
            self.ledger.submit_transaction(
                &tx.destination_account,
                &tx.source_account,
                amount,
                memo,
            ),
        )
        .await
    }

    fn set_state(&self, transaction_id: &str, state: RollbackState) {
        self.runs.insert(transaction_id.to_string(), state.clone());
        self.publish_state(transaction_id, &state);
    }

    fn publish_state(&self, transaction_id: &str, state: &RollbackState) {
        self.audit.log_event(
            AuditEvent::new("ROLLBACK_STATE_UPDATED", "Rollback state updated")
                .with("transaction_id", transaction_id)
                .with("state", state.name()),
        );
    }
}
