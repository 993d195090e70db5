//! Multi-stage transaction verification.
//!
//! Stages run in a fixed order and short-circuit: the first failing stage
//! records `Failed` and no later stage runs. The batched variant runs
//! bounded groups of stages concurrently and stops before the next group
//! when any stage of the current one fails.
//!
//! Each run is tagged with a run id. Only the run that currently owns a
//! transaction's entry may move it, and `Completed` / `Failed` are
//! absorbing.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VerificationConfig;
use crate::ledger::{
    call_with_timeout, AtomicSwapStatus, LedgerClient, LedgerError, LedgerTransaction,
    WalletConnectivity,
};
use crate::store::{ObservableStore, Snapshot};

/// Verification stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Basic,
    Blockchain,
    SmartContract,
    Escrow,
    FinalConsistency,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Basic,
        Stage::Blockchain,
        Stage::SmartContract,
        Stage::Escrow,
        Stage::FinalConsistency,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Stage::Basic => "Basic Transaction Validation",
            Stage::Blockchain => "Blockchain State Verification",
            Stage::SmartContract => "Smart Contract Verification",
            Stage::Escrow => "Escrow State Verification",
            Stage::FinalConsistency => "Final Consistency Check",
        }
    }

    #[must_use]
    pub const fn progress(self) -> u8 {
        match self {
            Stage::Basic => 20,
            Stage::Blockchain => 40,
            Stage::SmartContract => 60,
            Stage::Escrow => 80,
            Stage::FinalConsistency => 90,
        }
    }
}

/// Reason and details of a failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFailure {
    pub reason: String,
    pub details: String,
}

impl VerificationFailure {
    fn new(reason: &str, details: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            details: details.into(),
        }
    }

    fn from_ledger(error: &LedgerError) -> Self {
        Self::new("Verification error", error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VerificationState {
    InProgress { stage: String, progress: u8 },
    Completed,
    Failed { reason: String, details: String },
}

impl VerificationState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    #[must_use]
    pub fn progress(&self) -> u8 {
        match self {
            Self::InProgress { progress, .. } => *progress,
            Self::Completed => 100,
            Self::Failed { .. } => 0,
        }
    }

    fn started() -> Self {
        Self::InProgress {
            stage: "Starting verification".to_string(),
            progress: 0,
        }
    }

    fn at(stage: Stage) -> Self {
        Self::InProgress {
            stage: stage.name().to_string(),
            progress: stage.progress(),
        }
    }

    fn failed(failure: VerificationFailure) -> Self {
        Self::Failed {
            reason: failure.reason,
            details: failure.details,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::InProgress { .. } => "InProgress",
            Self::Completed => "Completed",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// One verification run of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRun {
    pub run_id: String,
    pub transaction_id: String,
    pub state: VerificationState,
    pub history: Vec<VerificationState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Verification pipeline with an observable run map keyed by transaction id.
pub struct VerificationPipeline {
    ledger: Arc<dyn LedgerClient>,
    wallet: Arc<dyn WalletConnectivity>,
    audit: Arc<dyn AuditSink>,
    runs: ObservableStore<String, VerificationRun>,
    config: VerificationConfig,
    call_timeout: Duration,
}

impl VerificationPipeline {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletConnectivity>,
        audit: Arc<dyn AuditSink>,
        config: VerificationConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            wallet,
            audit,
            runs: ObservableStore::new(),
            config,
            call_timeout,
        }
    }

    /// Run every stage in order and return the final state.
    pub async fn start_verification(&self, transaction_id: &str) -> VerificationState {
        self.run(transaction_id, false).await
    }

    /// Run the stages in concurrent batches of `batch_size`.
    pub async fn start_verification_batched(&self, transaction_id: &str) -> VerificationState {
        self.run(transaction_id, true).await
    }

    /// Current state of a transaction's latest run.
    pub fn state(&self, transaction_id: &str) -> Option<VerificationState> {
        self.runs.get(&transaction_id.to_string()).map(|r| r.state)
    }

    pub fn run_of(&self, transaction_id: &str) -> Option<VerificationRun> {
        self.runs.get(&transaction_id.to_string())
    }

    pub fn runs(&self) -> Snapshot<String, VerificationRun> {
        self.runs.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, VerificationRun>> {
        self.runs.subscribe()
    }

    async fn run(&self, transaction_id: &str, batched: bool) -> VerificationState {
        let run_id = Uuid::new_v4().to_string();
        self.runs.insert(
            transaction_id.to_string(),
            VerificationRun {
                run_id: run_id.clone(),
                transaction_id: transaction_id.to_string(),
                state: VerificationState::started(),
                history: vec![VerificationState::started()],
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        info!(transaction_id, batched, "Starting verification");
        self.audit.log_event(
            AuditEvent::new("VERIFICATION_STARTED", "Starting multi-stage verification")
                .with("transaction_id", transaction_id)
                .with("batched", batched),
        );

        let body = async {
            if batched {
                self.run_batched(transaction_id, &run_id).await
            } else {
                self.run_sequential(transaction_id, &run_id).await
            }
        };

        let outcome = match tokio::time::timeout(self.config.timeout, body).await {
            Ok(outcome) => outcome,
            Err(_) => Err(VerificationFailure::new(
                "Verification timed out",
                format!("Exceeded {}ms", self.config.timeout.as_millis()),
            )),
        };

        let final_state = match outcome {
            Ok(()) => {
                self.audit.log_event(
                    AuditEvent::new(
                        "VERIFICATION_COMPLETED",
                        "Multi-stage verification completed successfully",
                    )
                    .with("transaction_id", transaction_id),
                );
                VerificationState::Completed
            }
            Err(failure) => {
                warn!(
                    transaction_id,
                    reason = %failure.reason,
                    details = %failure.details,
                    "Verification failed"
                );
                if failure.reason == "Verification error" || failure.reason == "Verification timed out" {
                    self.audit.log_event(
                        AuditEvent::new("VERIFICATION_ERROR", "Error during verification")
                            .with("transaction_id", transaction_id)
                            .with("error", &failure.details),
                    );
                }
                VerificationState::failed(failure)
            }
        };

        self.transition(transaction_id, &run_id, final_state.clone());
        final_state
    }

    async fn run_sequential(&self, transaction_id: &str, run_id: &str) -> Result<(), VerificationFailure> {
        let tx = self.fetch(transaction_id).await?;
        for stage in Stage::ALL {
            self.transition(transaction_id, run_id, VerificationState::at(stage));
            self.check(stage, &tx).await?;
        }
        Ok(())
    }

    async fn run_batched(&self, transaction_id: &str, run_id: &str) -> Result<(), VerificationFailure> {
        let tx = self.fetch(transaction_id).await?;
        for batch in Stage::ALL.chunks(self.config.batch_size.max(1)) {
            let results = join_all(batch.iter().map(|stage| self.check(*stage, &tx))).await;
            if let Some(failure) = results.into_iter().find_map(Result::err) {
                return Err(failure);
            }
            if let Some(last) = batch.last() {
                self.transition(transaction_id, run_id, VerificationState::at(*last));
            }
        }
        Ok(())
    }

    async fn fetch(&self, transaction_id: &str) -> Result<LedgerTransaction, VerificationFailure> {
        call_with_timeout(
            self.call_timeout,
            "get_transaction",
            self.ledger.get_transaction(transaction_id),
        )
        .await
        .map_err(|e| VerificationFailure::from_ledger(&e))
    }

    async fn check(&self, stage: Stage, tx: &LedgerTransaction) -> Result<(), VerificationFailure> {
        debug!(transaction_id = %tx.id, stage = stage.name(), "Running verification stage");
        match stage {
            Stage::Basic => {
                if tx.has_complete_details() {
                    Ok(())
                } else {
                    Err(VerificationFailure::new(
                        "Basic transaction validation failed",
                        "Transaction details are incomplete or invalid",
                    ))
                }
            }
            Stage::Blockchain => {
                let chain = self.chain_healthy().await?;
                if chain {
                    Ok(())
                } else {
                    Err(VerificationFailure::new(
                        "Blockchain state verification failed",
                        "Blockchain network is not in a healthy state",
                    ))
                }
            }
            Stage::SmartContract => {
                let Some(contract) = tx.contract_address() else {
                    return Ok(());
                };
                let oracle = call_with_timeout(
                    self.call_timeout,
                    "get_oracle_data",
                    self.ledger.get_oracle_data(contract),
                )
                .await
                .map_err(|e| VerificationFailure::from_ledger(&e))?;
                if oracle.state_valid {
                    Ok(())
                } else {
                    Err(VerificationFailure::new(
                        "Smart contract verification failed",
                        "Contract state is invalid",
                    ))
                }
            }
            Stage::Escrow => {
                let Some(escrow) = tx.escrow_address() else {
                    return Ok(());
                };
                let data = call_with_timeout(
                    self.call_timeout,
                    "get_escrow_data",
                    self.ledger.get_escrow_data(escrow),
                )
                .await
                .map_err(|e| VerificationFailure::from_ledger(&e))?;
                if data.is_valid() {
                    Ok(())
                } else {
                    Err(VerificationFailure::new(
                        "Escrow state verification failed",
                        "Escrow state is invalid",
                    ))
                }
            }
            Stage::FinalConsistency => {
                let swap = call_with_timeout(
                    self.call_timeout,
                    "get_atomic_swap_status",
                    self.ledger.get_atomic_swap_status(&tx.id),
                )
                .await
                .map_err(|e| VerificationFailure::from_ledger(&e))?;
                let consistent = tx.is_consistent()
                    && self.wallet.is_connected().await
                    && self.chain_healthy().await?
                    && swap != AtomicSwapStatus::Failed;
                if consistent {
                    Ok(())
                } else {
                    Err(VerificationFailure::new(
                        "Final consistency check failed",
                        "Transaction state is inconsistent",
                    ))
                }
            }
        }
    }

    async fn chain_healthy(&self) -> Result<bool, VerificationFailure> {
        call_with_timeout(
            self.call_timeout,
            "get_blockchain_state",
            self.ledger.get_blockchain_state(),
        )
        .await
        .map(|state| state.is_healthy())
        .map_err(|e| VerificationFailure::from_ledger(&e))
    }

    /// Move the run owned by `run_id` to `next`. Ignored once the run is
    /// terminal or has been superseded by a newer run.
    fn transition(&self, transaction_id: &str, run_id: &str, next: VerificationState) {
        let key = transaction_id.to_string();
        let applied = self
            .runs
            .update(|runs| match runs.get_mut(&key) {
                Some(run) if run.run_id == run_id && !run.state.is_terminal() => {
                    if next.is_terminal() {
                        run.finished_at = Some(Utc::now());
                    }
                    run.history.push(next.clone());
                    run.state = next.clone();
                    true
                }
                _ => false,
            });

        if applied {
            self.audit.log_event(
                AuditEvent::new("VERIFICATION_STATE_UPDATED", "Verification state updated")
                    .with("transaction_id", transaction_id)
                    .with("state", next.label())
                    .with("progress", next.progress()),
            );
        } else {
            debug!(transaction_id, run_id, "Ignoring verification update for stale run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{InMemoryLedger, StaticWallet};
    use crate::ledger::{
        Amount, BlockchainState, EscrowData, EscrowStatus, Operation, OracleData,
        TransactionStatus,
    };
    use audit::AuditLog;

    fn settled(id: &str) -> LedgerTransaction {
        let created = Utc::now() - chrono::Duration::seconds(5);
        LedgerTransaction {
            id: id.to_string(),
            source_account: "GBUYER".to_string(),
            destination_account: "GSELLER".to_string(),
            amount: Amount::from_units(25),
            fee_charged: Amount::from_stroops(100),
            status: TransactionStatus::Success,
            result_code: "tx_success".to_string(),
            created_at: created,
            closed_at: Some(created + chrono::Duration::seconds(3)),
            operations: vec![Operation::payment()],
            balances: vec![],
            sequence: None,
            account_sequence: None,
            memo: None,
        }
    }

    fn pipeline(ledger: Arc<InMemoryLedger>, wallet: Arc<StaticWallet>) -> (VerificationPipeline, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        (
            VerificationPipeline::new(
                ledger,
                wallet,
                audit.clone(),
                VerificationConfig::default(),
                Duration::from_secs(1),
            ),
            audit,
        )
    }

    #[tokio::test]
    async fn test_happy_path_reaches_completed() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.put_transaction(settled("tx-1"));
        let (pipeline, audit) = pipeline(ledger, Arc::new(StaticWallet::default()));

        let state = pipeline.start_verification("tx-1").await;

        assert_eq!(state, VerificationState::Completed);
        let run = pipeline.run_of("tx-1").unwrap();
        let progress: Vec<u8> = run.history.iter().map(VerificationState::progress).collect();
        assert_eq!(progress, vec![0, 20, 40, 60, 80, 90, 100]);
        assert!(run.finished_at.is_some());
        assert_eq!(audit.trail().events_of_type("VERIFICATION_COMPLETED").len(), 1);
    }

    #[tokio::test]
    async fn test_basic_failure_short_circuits() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut tx = settled("tx-2");
        tx.source_account = String::new();
        ledger.put_transaction(tx);
        let (pipeline, _) = pipeline(ledger.clone(), Arc::new(StaticWallet::default()));

        let state = pipeline.start_verification("tx-2").await;

        assert_eq!(
            state,
            VerificationState::Failed {
                reason: "Basic transaction validation failed".to_string(),
                details: "Transaction details are incomplete or invalid".to_string(),
            }
        );
        assert_eq!(ledger.call_count("get_blockchain_state"), 0);
        assert_eq!(ledger.call_count("get_atomic_swap_status"), 0);
    }

    #[tokio::test]
    async fn test_invalid_escrow_fails_at_escrow_stage() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut tx = settled("tx-3");
        tx.operations.push(Operation::manage_escrow("GESCROW"));
        ledger.put_transaction(tx);
        ledger.put_escrow(EscrowData {
            address: "GESCROW".to_string(),
            status: EscrowStatus::Active,
            balance: Amount::from_units(25),
            required_signatures: 2,
            collected_signatures: 1,
        });
        let (pipeline, _) = pipeline(ledger.clone(), Arc::new(StaticWallet::default()));

        let state = pipeline.start_verification("tx-3").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Escrow state verification failed"
        ));
        assert_eq!(ledger.call_count("get_atomic_swap_status"), 0);
    }

    #[tokio::test]
    async fn test_final_check_requires_wallet() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.put_transaction(settled("tx-4"));
        let (pipeline, _) = pipeline(ledger, Arc::new(StaticWallet::new(false)));

        let state = pipeline.start_verification("tx-4").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Final consistency check failed"
        ));
    }

    #[tokio::test]
    async fn test_contract_state_checked_for_invocations() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut tx = settled("tx-5");
        tx.operations = vec![Operation::invoke_contract("CESCROW", "release")];
        ledger.put_transaction(tx);
        ledger.put_oracle(OracleData {
            contract_address: "CESCROW".to_string(),
            state_valid: false,
            observed_at: Utc::now(),
        });
        let (pipeline, _) = pipeline(ledger, Arc::new(StaticWallet::default()));

        let state = pipeline.start_verification_batched("tx-5").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Smart contract verification failed"
        ));
    }

    #[tokio::test]
    async fn test_batched_halts_after_failed_batch() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.put_transaction(settled("tx-6"));
        ledger.set_blockchain_state(BlockchainState {
            congestion: 0.95,
            ..BlockchainState::default()
        });
        let audit = Arc::new(AuditLog::in_memory());
        let pipeline = VerificationPipeline::new(
            ledger.clone(),
            Arc::new(StaticWallet::default()),
            audit,
            VerificationConfig {
                batch_size: 2,
                ..VerificationConfig::default()
            },
            Duration::from_secs(1),
        );

        let state = pipeline.start_verification_batched("tx-6").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Blockchain state verification failed"
        ));
        assert_eq!(ledger.call_count("get_atomic_swap_status"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_fails_run() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.put_transaction(settled("tx-7"));
        ledger.set_latency("get_blockchain_state", Duration::from_secs(20));
        let audit = Arc::new(AuditLog::in_memory());
        let pipeline = VerificationPipeline::new(
            ledger,
            Arc::new(StaticWallet::default()),
            audit.clone(),
            VerificationConfig {
                timeout: Duration::from_secs(5),
                batch_size: 5,
            },
            Duration::from_secs(60),
        );

        let state = pipeline.start_verification("tx-7").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Verification timed out"
        ));
        assert_eq!(audit.trail().events_of_type("VERIFICATION_ERROR").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_transaction_is_verification_error() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (pipeline, _) = pipeline(ledger, Arc::new(StaticWallet::default()));

        let state = pipeline.start_verification("nope").await;

        assert!(matches!(
            state,
            VerificationState::Failed { ref reason, .. } if reason == "Verification error"
        ));
    }
}
