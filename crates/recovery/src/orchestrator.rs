//! Recovery orchestration.
//!
//! [`RecoveryOrchestrator::report_error`] registers a run in `Analyzing`
//! and hands the error to a background task that captures the system state,
//! feeds the pattern tracker, asks forensics for a risk assessment and then
//! applies the strategy for the error type:
//!
//! | Error | Strategy |
//! |---|---|
//! | NetworkCongestion | wait `network_retry_delay`, then `Recovering` |
//! | WalletConnectionLost | re-check with backoff, ticket on exhaustion |
//! | EscrowVerificationFailed | re-validate once, ticket on failure |
//! | InsufficientFunds, SmartContractFailure | ticket immediately |
//! | SystemSynchronization, Blockchain, Timeout, Unknown | rollback, ticket on failure |
//!
//! CRITICAL errors and errors raised while a subsystem is down skip the
//! table and go straight to a ticket.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::{AdminRole, InterventionDesk, InterventionTicket};
use crate::config::{RecoveryConfig, RetryConfig};
use crate::error::{EngineError, EngineResult};
use crate::forensics::{escrow_of, ForensicsAnalyzer};
use crate::ledger::{call_with_timeout, LedgerClient, WalletConnectivity};
use crate::patterns::PatternTracker;
use crate::rollback::{RollbackEngine, RollbackState};
use crate::state::{TerminalOutcome, TransactionState, TransactionStateManager};
use crate::store::{ObservableStore, Snapshot};
use crate::system::SystemState;
use crate::taxonomy::{ErrorKind, Severity, TransactionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStatus {
    Analyzing,
    Attempting,
    Recovering,
    ManualInterventionRequired,
    Recovered,
    Failed,
    NotFound,
}

impl RecoveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analyzing => "ANALYZING",
            Self::Attempting => "ATTEMPTING",
            Self::Recovering => "RECOVERING",
            Self::ManualInterventionRequired => "MANUAL_INTERVENTION_REQUIRED",
            Self::Recovered => "RECOVERED",
            Self::Failed => "FAILED",
            Self::NotFound => "NOT_FOUND",
        }
    }

    /// Whether the run still has a task working on it.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Analyzing | Self::Attempting)
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    WaitAndRetry,
    Rollback,
    Escalate,
}

impl RecoveryStrategy {
    /// Default strategy for an error type.
    #[must_use]
    pub const fn for_kind(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::NetworkCongestion { .. } => Self::WaitAndRetry,
            ErrorKind::WalletConnectionLost { .. } | ErrorKind::EscrowVerificationFailed { .. } => {
                Self::Retry
            }
            ErrorKind::InsufficientFunds { .. } | ErrorKind::SmartContractFailure { .. } => {
                Self::Escalate
            }
            ErrorKind::SystemSynchronization { .. }
            | ErrorKind::Blockchain { .. }
            | ErrorKind::Timeout { .. }
            | ErrorKind::Unknown { .. } => Self::Rollback,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::WaitAndRetry => "WAIT_AND_RETRY",
            Self::Rollback => "ROLLBACK",
            Self::Escalate => "ESCALATE",
        }
    }
}

/// Outcome reported for a recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub status: RecoveryStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TransactionError>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl RecoveryResult {
    pub fn new(
        status: RecoveryStatus,
        message: impl Into<String>,
        error: Option<&TransactionError>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            error: error.cloned(),
            details: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// One recovery run, keyed by its error id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRun {
    pub error_id: String,
    pub error: TransactionError,
    pub status: RecoveryStatus,
    pub strategy: Option<RecoveryStrategy>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_result: Option<RecoveryResult>,
    pub history: Vec<(RecoveryStatus, DateTime<Utc>)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RecoveryRun {
    fn new(error_id: String, error: TransactionError) -> Self {
        let now = Utc::now();
        Self {
            error_id,
            error,
            status: RecoveryStatus::Analyzing,
            strategy: None,
            attempts: 0,
            max_attempts: 1,
            last_result: None,
            history: vec![(RecoveryStatus::Analyzing, now)],
            started_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, status: RecoveryStatus) {
        self.status = status;
        self.history.push((status, Utc::now()));
        if !status.is_active() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub ledger: Arc<dyn LedgerClient>,
    pub wallet: Arc<dyn WalletConnectivity>,
    pub patterns: Arc<PatternTracker>,
    pub forensics: Arc<ForensicsAnalyzer>,
    pub rollback: Arc<RollbackEngine>,
    pub interventions: Arc<InterventionDesk>,
    pub states: Arc<TransactionStateManager>,
    pub audit: Arc<dyn AuditSink>,
}

/// Dispatches reported errors to recovery strategies and tracks the runs.
pub struct RecoveryOrchestrator {
    deps: OrchestratorDeps,
    retry: RetryConfig,
    network_retry_delay: Duration,
    call_timeout: Duration,
    runs: ObservableStore<String, RecoveryRun>,
    cancellations: Mutex<HashMap<String, watch::Sender<bool>>>,
}

/// Failed subsystems that force escalation. A broken escrow is the subject of
/// an escrow verification error, not a reason to skip its re-validation.
fn escalating_subsystems(error: &TransactionError, state: &SystemState) -> Vec<&'static str> {
    let mut failed = state.failed_subsystems();
    if matches!(error.kind, ErrorKind::EscrowVerificationFailed { .. }) {
        failed.retain(|subsystem| *subsystem != "escrow");
    }
    failed
}

async fn cancelled(mut signal: watch::Receiver<bool>) {
    // A dropped sender also ends the wait.
    let _ = signal.wait_for(|cancelled| *cancelled).await;
}

impl RecoveryOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: &RecoveryConfig) -> Self {
        Self {
            deps,
            retry: config.retry.clone(),
            network_retry_delay: config.network_retry_delay,
            call_timeout: config.ledger_call_timeout,
            runs: ObservableStore::new(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Register `error` for recovery and start working on it in the
    /// background. Returns the run's error id.
    ///
    /// While a run for the same transaction is still active its id is
    /// returned instead of starting a second one.
    pub fn report_error(self: &Arc<Self>, error: TransactionError) -> String {
        let error_id = format!("err-{}", Uuid::new_v4());
        let existing = self.runs.update(|runs| {
            let active = runs
                .values()
                .find(|run| {
                    run.status.is_active() && run.error.transaction_id == error.transaction_id
                })
                .map(|run| run.error_id.clone());
            if active.is_none() {
                runs.insert(error_id.clone(), RecoveryRun::new(error_id.clone(), error.clone()));
            }
            active
        });
        if let Some(existing) = existing {
            debug!(transaction_id = %error.transaction_id, error_id = %existing, "Recovery already active");
            return existing;
        }

        info!(
            error_id = %error_id,
            transaction_id = %error.transaction_id,
            error_type = error.kind_name(),
            "Transaction error reported"
        );
        self.deps.audit.log_event(
            AuditEvent::new("RECOVERY_INITIATED", "Recovery initiated")
                .with("error_id", &error_id)
                .with("transaction_id", &error.transaction_id)
                .with("error_type", error.kind_name())
                .with("severity", error.severity),
        );
        if let Err(e) = self
            .deps
            .states
            .record_error(&error.transaction_id, &error.message)
        {
            debug!(error = %e, "Transaction state not moved to Error");
        }

        let (cancel, signal) = watch::channel(false);
        let mut cancellations = self.cancellations.lock();
        cancellations.insert(error_id.clone(), cancel);
        let this = Arc::clone(self);
        let run_id = error_id.clone();
        tokio::spawn(async move { this.drive(run_id, error, signal).await });
        drop(cancellations);

        error_id
    }

    async fn drive(
        self: Arc<Self>,
        error_id: String,
        error: TransactionError,
        signal: watch::Receiver<bool>,
    ) {
        let outcome = tokio::select! {
            result = self.attempt_recovery(&error_id, &error) => Some(result),
            () = cancelled(signal) => None,
        };
        self.cancellations.lock().remove(&error_id);

        match outcome {
            Some(result) => self.finish(&error_id, &error, result),
            None => debug!(error_id = %error_id, "Recovery task stopped after cancellation"),
        }
    }

    async fn attempt_recovery(&self, error_id: &str, error: &TransactionError) -> RecoveryResult {
        self.set_status(error_id, RecoveryStatus::Attempting);

        let state = SystemState::capture(
            self.deps.ledger.as_ref(),
            self.deps.wallet.as_ref(),
            escrow_of(error),
            self.call_timeout,
        )
        .await;
        self.deps.patterns.observe(error, &state);
        let report = self.deps.forensics.assess_with_state(error, &state);

        let failed_subsystems = escalating_subsystems(error, &state);
        if error.severity == Severity::Critical || !failed_subsystems.is_empty() {
            warn!(
                error_id,
                risk_level = %report.risk_level,
                failed_subsystems = ?failed_subsystems,
                "Escalating high-risk error"
            );
            self.set_strategy(error_id, RecoveryStrategy::Escalate, 1);
            let ticket = self.open_ticket(error_id, error, "Critical risk detected");
            return RecoveryResult::new(
                RecoveryStatus::ManualInterventionRequired,
                format!("Manual intervention required: critical risk. Ticket: {}", ticket.ticket_id),
                Some(error),
            )
            .detail("ticket_id", &ticket.ticket_id)
            .detail("risk_level", report.risk_level)
            .detail("failed_subsystems", failed_subsystems.join(","));
        }

        let strategy = RecoveryStrategy::for_kind(&error.kind);
        let max_attempts = match &error.kind {
            ErrorKind::WalletConnectionLost { .. } => self.retry.max_attempts,
            _ => 1,
        };
        self.set_strategy(error_id, strategy, max_attempts);

        match &error.kind {
            ErrorKind::NetworkCongestion { .. } => self.wait_out_congestion(error_id, error).await,
            ErrorKind::InsufficientFunds { .. } => {
                let ticket = self.open_ticket(error_id, error, "Insufficient funds");
                RecoveryResult::new(
                    RecoveryStatus::ManualInterventionRequired,
                    "Manual intervention required: Insufficient funds",
                    Some(error),
                )
                .detail("ticket_id", ticket.ticket_id)
            }
            ErrorKind::SmartContractFailure { .. } => {
                let ticket = self.open_ticket(error_id, error, "Smart contract failure");
                RecoveryResult::new(
                    RecoveryStatus::ManualInterventionRequired,
                    "Manual intervention required: Smart contract failure",
                    Some(error),
                )
                .detail("ticket_id", ticket.ticket_id)
            }
            ErrorKind::WalletConnectionLost { .. } => self.restore_wallet(error_id, error).await,
            ErrorKind::EscrowVerificationFailed { escrow_address, .. } => {
                self.revalidate_escrow(error_id, error, escrow_address).await
            }
            ErrorKind::Unknown { .. } => {
                self.record_attempt(error_id, 1);
                if self.validate_transaction_integrity(&error.transaction_id).await {
                    self.advance_state(
                        &error.transaction_id,
                        TransactionState::Terminal {
                            outcome: TerminalOutcome::Success,
                        },
                    );
                    return RecoveryResult::new(
                        RecoveryStatus::Recovered,
                        "Transaction validated successfully despite unknown error",
                        Some(error),
                    );
                }
                self.roll_back(error_id, error).await
            }
            ErrorKind::SystemSynchronization { .. }
            | ErrorKind::Blockchain { .. }
            | ErrorKind::Timeout { .. } => {
                self.record_attempt(error_id, 1);
                self.roll_back(error_id, error).await
            }
        }
    }

    async fn wait_out_congestion(&self, error_id: &str, error: &TransactionError) -> RecoveryResult {
        warn!(error_id, message = %error.message, "Handling network congestion");
        self.record_attempt(error_id, 1);
        tokio::time::sleep(self.network_retry_delay).await;
        self.advance_state(&error.transaction_id, TransactionState::Processing);
        RecoveryResult::new(
            RecoveryStatus::Recovering,
            "Retrying after network congestion",
            Some(error),
        )
        .detail("retry_delay", self.network_retry_delay.as_millis())
    }

    async fn restore_wallet(&self, error_id: &str, error: &TransactionError) -> RecoveryResult {
        for attempt in 1..=self.retry.max_attempts {
            self.record_attempt(error_id, attempt);
            debug!(error_id, attempt, "Attempting to restore wallet connection");

            if self.deps.wallet.is_connected().await
                && self.validate_transaction_integrity(&error.transaction_id).await
            {
                info!(transaction_id = %error.transaction_id, attempt, "Wallet connection restored");
                self.advance_state(
                    &error.transaction_id,
                    TransactionState::Terminal {
                        outcome: TerminalOutcome::Success,
                    },
                );
                return RecoveryResult::new(
                    RecoveryStatus::Recovered,
                    "Wallet connection restored",
                    Some(error),
                )
                .detail("attempts", attempt);
            }

            if self.retry.should_retry(attempt) {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            }
        }

        error!(error_id, max_attempts = self.retry.max_attempts, "Unable to restore wallet connection");
        let ticket = self.open_ticket(error_id, error, "Wallet connection could not be restored");
        RecoveryResult::new(
            RecoveryStatus::ManualInterventionRequired,
            "Unable to restore wallet connection",
            Some(error),
        )
        .detail("max_attempts", self.retry.max_attempts)
        .detail("ticket_id", ticket.ticket_id)
    }

    async fn revalidate_escrow(
        &self,
        error_id: &str,
        error: &TransactionError,
        escrow_address: &str,
    ) -> RecoveryResult {
        self.record_attempt(error_id, 1);
        let valid = match call_with_timeout(
            self.call_timeout,
            "get_escrow_data",
            self.deps.ledger.get_escrow_data(escrow_address),
        )
        .await
        {
            Ok(escrow) => escrow.is_valid(),
            Err(e) => {
                warn!(error_id, escrow_address, error = %e, "Escrow re-validation failed");
                false
            }
        };

        if valid {
            self.advance_state(
                &error.transaction_id,
                TransactionState::Terminal {
                    outcome: TerminalOutcome::Success,
                },
            );
            return RecoveryResult::new(
                RecoveryStatus::Recovered,
                "Escrow verification succeeded on retry",
                Some(error),
            );
        }

        let ticket = self.open_ticket(error_id, error, "Escrow verification failed");
        RecoveryResult::new(
            RecoveryStatus::ManualInterventionRequired,
            format!("Manual escrow verification required. Ticket: {}", ticket.ticket_id),
            Some(error),
        )
        .detail("ticket_id", ticket.ticket_id)
    }

    async fn roll_back(&self, error_id: &str, error: &TransactionError) -> RecoveryResult {
        let transaction_id = &error.transaction_id;
        self.advance_state(transaction_id, TransactionState::RollbackInitiated);
        self.advance_state(transaction_id, TransactionState::RollbackInProgress);

        let reason = match self
            .deps
            .rollback
            .initiate_rollback(transaction_id, error)
            .await
        {
            Ok(RollbackState::Completed { refund_tx_id }) => {
                self.advance_state(
                    transaction_id,
                    TransactionState::Terminal {
                        outcome: TerminalOutcome::RolledBack,
                    },
                );
                return RecoveryResult::new(
                    RecoveryStatus::Recovered,
                    "Transaction rolled back successfully",
                    Some(error),
                )
                .detail("rollback_tx", refund_tx_id);
            }
            Ok(RollbackState::RequiresManualIntervention { reason, .. }) => reason,
            Ok(other) => format!("Rollback ended in state {}", other.name()),
            Err(e) => format!("Rollback failed: {e}"),
        };

        let (ticket_reason, message) = match &error.kind {
            ErrorKind::SystemSynchronization { .. } => (
                "System synchronization error - rollback failed",
                "Manual synchronization required",
            ),
            ErrorKind::Unknown { .. } => (
                "Unknown error - requires investigation",
                "Manual intervention required for unknown error",
            ),
            _ => ("Rollback failed", "Manual intervention required"),
        };
        let ticket = self.open_ticket(error_id, error, ticket_reason);
        RecoveryResult::new(
            RecoveryStatus::ManualInterventionRequired,
            format!("{message}. Ticket: {}", ticket.ticket_id),
            Some(error),
        )
        .detail("ticket_id", ticket.ticket_id)
        .detail("rollback_reason", reason)
    }

    fn open_ticket(&self, error_id: &str, error: &TransactionError, reason: &str) -> InterventionTicket {
        self.deps.interventions.create_intervention_request(
            error,
            error_id,
            reason,
            AdminRole::RecoverySpecialist,
            error.severity.into(),
        )
    }

    fn finish(&self, error_id: &str, error: &TransactionError, result: RecoveryResult) {
        let key = error_id.to_string();
        let applied = self.runs.update(|runs| match runs.get_mut(&key) {
            Some(run) if run.status.is_active() => {
                run.transition(result.status);
                run.last_result = Some(result.clone());
                true
            }
            _ => false,
        });
        if !applied {
            return;
        }

        info!(
            error_id,
            transaction_id = %error.transaction_id,
            status = %result.status,
            message = %result.message,
            "Recovery finished"
        );
        self.deps.audit.log_event(
            AuditEvent::new("RECOVERY_COMPLETED", "Recovery run finished")
                .with("error_id", error_id)
                .with("transaction_id", &error.transaction_id)
                .with("status", result.status)
                .with("message", &result.message)
                .with_all(result.details.clone()),
        );
    }

    fn set_status(&self, error_id: &str, status: RecoveryStatus) {
        self.runs.modify(&error_id.to_string(), |run| {
            if run.status.is_active() {
                run.transition(status);
            }
        });
    }

    fn set_strategy(&self, error_id: &str, strategy: RecoveryStrategy, max_attempts: u32) {
        debug!(error_id, strategy = strategy.as_str(), "Recovery strategy selected");
        self.runs.modify(&error_id.to_string(), |run| {
            run.strategy = Some(strategy);
            run.max_attempts = max_attempts;
        });
    }

    fn record_attempt(&self, error_id: &str, attempt: u32) {
        self.runs.modify(&error_id.to_string(), |run| run.attempts = attempt);
    }

    fn advance_state(&self, transaction_id: &str, next: TransactionState) {
        if let Err(e) = self.deps.states.update_state(transaction_id, next) {
            debug!(transaction_id, error = %e, "Transaction state unchanged");
        }
    }

    /// Latest result for a run. Unknown ids report `NotFound`.
    pub fn get_recovery_status(&self, error_id: &str) -> RecoveryResult {
        match self.runs.get(&error_id.to_string()) {
            Some(run) => run.last_result.unwrap_or_else(|| {
                RecoveryResult::new(
                    run.status,
                    format!("Current status: {}", run.status),
                    Some(&run.error),
                )
            }),
            None => {
                warn!(error_id, "Error not found in active recoveries");
                RecoveryResult::new(
                    RecoveryStatus::NotFound,
                    format!("Error {error_id} not found in active recoveries"),
                    None,
                )
            }
        }
    }

    pub fn run(&self, error_id: &str) -> Option<RecoveryRun> {
        self.runs.get(&error_id.to_string())
    }

    /// Cancel an active run and mark it `Failed`.
    ///
    /// Returns `Ok(false)` when the run had already finished.
    pub fn cancel_recovery(&self, error_id: &str) -> EngineResult<bool> {
        let key = error_id.to_string();
        let cancelled = self.runs.update(|runs| match runs.get_mut(&key) {
            None => Err(EngineError::RecoveryNotFound {
                error_id: key.clone(),
            }),
            Some(run) if run.status.is_active() => {
                run.transition(RecoveryStatus::Failed);
                run.last_result = Some(RecoveryResult::new(
                    RecoveryStatus::Failed,
                    "Recovery cancelled",
                    Some(&run.error),
                ));
                Ok(Some(run.error.transaction_id.clone()))
            }
            Some(_) => Ok(None),
        })?;

        if let Some(cancel) = self.cancellations.lock().remove(error_id) {
            let _ = cancel.send(true);
        }
        let Some(transaction_id) = cancelled else {
            return Ok(false);
        };

        info!(error_id, transaction_id = %transaction_id, "Recovery cancelled");
        self.advance_state(
            &transaction_id,
            TransactionState::Terminal {
                outcome: TerminalOutcome::Failed,
            },
        );
        self.deps.audit.log_event(
            AuditEvent::new("RECOVERY_CANCELLED", "Recovery cancelled")
                .with("error_id", error_id)
                .with("transaction_id", &transaction_id),
        );
        Ok(true)
    }

    /// Open a ticket for an error outside the automatic strategies. A run
    /// recovering the same error is moved to `ManualInterventionRequired`.
    pub fn request_manual_intervention(
        &self,
        error: &TransactionError,
        reason: &str,
    ) -> InterventionTicket {
        let run_id = self
            .runs
            .snapshot()
            .values()
            .find(|run| run.error.id == error.id)
            .map(|run| run.error_id.clone());
        let ticket = self.open_ticket(run_id.as_deref().unwrap_or(&error.id), error, reason);

        if let Some(run_id) = run_id {
            let result = RecoveryResult::new(
                RecoveryStatus::ManualInterventionRequired,
                reason,
                Some(error),
            )
            .detail("ticket_id", &ticket.ticket_id);
            self.finish(&run_id, error, result);
            if let Some(cancel) = self.cancellations.lock().remove(&run_id) {
                let _ = cancel.send(true);
            }
        }
        ticket
    }

    /// Whether the ledger reports the transaction as successful. Lookup
    /// failures count as invalid.
    pub async fn validate_transaction_integrity(&self, transaction_id: &str) -> bool {
        match call_with_timeout(
            self.call_timeout,
            "get_transaction",
            self.deps.ledger.get_transaction(transaction_id),
        )
        .await
        {
            Ok(tx) => {
                let valid = tx.is_successful();
                debug!(transaction_id, valid, "Transaction integrity checked");
                valid
            }
            Err(e) => {
                warn!(transaction_id, error = %e, "Failed to validate transaction integrity");
                false
            }
        }
    }

    /// Errors whose runs are still being worked on.
    pub fn get_active_recoveries(&self) -> Vec<TransactionError> {
        let mut active: Vec<(DateTime<Utc>, TransactionError)> = self
            .runs
            .snapshot()
            .values()
            .filter(|run| run.status.is_active())
            .map(|run| (run.started_at, run.error.clone()))
            .collect();
        active.sort_by_key(|(started, _)| *started);
        active.into_iter().map(|(_, error)| error).collect()
    }

    pub fn runs(&self) -> Snapshot<String, RecoveryRun> {
        self.runs.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, RecoveryRun>> {
        self.runs.subscribe()
    }

    /// Wait until the run leaves the active states.
    pub async fn wait_for_outcome(&self, error_id: &str) -> Option<RecoveryRun> {
        let mut runs = self.runs.subscribe();
        let key = error_id.to_string();
        let snapshot = runs
            .wait_for(|runs| !runs.get(&key).is_some_and(|run| run.status.is_active()))
            .await
            .ok()?;
        snapshot.get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{OperationPermissions, RoleDirectory, SessionManager, TicketStatus};
    use crate::classifier::ErrorClassifier;
    use crate::ledger::memory::{InMemoryLedger, StaticWallet};
    use crate::ledger::{Amount, EscrowData, EscrowStatus, LedgerTransaction, Operation, TransactionStatus};
    use crate::taxonomy::CongestionLevel;
    use audit::AuditLog;

    struct Harness {
        orchestrator: Arc<RecoveryOrchestrator>,
        ledger: Arc<InMemoryLedger>,
        wallet: Arc<StaticWallet>,
        desk: Arc<InterventionDesk>,
        states: Arc<TransactionStateManager>,
        audit: Arc<AuditLog>,
    }

    fn harness() -> Harness {
        let audit = Arc::new(AuditLog::in_memory());
        let ledger = Arc::new(InMemoryLedger::new());
        let wallet = Arc::new(StaticWallet::new(true));
        let config = RecoveryConfig::default();
        let timeout = config.ledger_call_timeout;

        let directory = Arc::new(RoleDirectory::new(audit.clone()));
        let sessions = Arc::new(SessionManager::new(directory.clone(), config.session_timeout, audit.clone()));
        let desk = Arc::new(InterventionDesk::new(
            directory,
            sessions,
            Arc::new(OperationPermissions::new()),
            audit.clone(),
        ));
        let patterns = Arc::new(PatternTracker::new(config.pattern_window, audit.clone()));
        let classifier = Arc::new(ErrorClassifier::new(
            ledger.clone(),
            wallet.clone(),
            audit.clone(),
            config.congestion_latency_threshold,
            timeout,
        ));
        let forensics = Arc::new(ForensicsAnalyzer::new(
            ledger.clone(),
            wallet.clone(),
            classifier,
            patterns.clone(),
            audit.clone(),
            timeout,
        ));
        let rollback = Arc::new(RollbackEngine::new(ledger.clone(), wallet.clone(), audit.clone(), timeout));
        let states = Arc::new(TransactionStateManager::new(audit.clone()));

        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            OrchestratorDeps {
                ledger: ledger.clone(),
                wallet: wallet.clone(),
                patterns,
                forensics,
                rollback,
                interventions: desk.clone(),
                states: states.clone(),
                audit: audit.clone(),
            },
            &config,
        ));
        Harness {
            orchestrator,
            ledger,
            wallet,
            desk,
            states,
            audit,
        }
    }

    fn tx(id: &str, status: TransactionStatus) -> LedgerTransaction {
        let now = Utc::now();
        LedgerTransaction {
            id: id.to_string(),
            source_account: "GBUYER".to_string(),
            destination_account: "GSELLER".to_string(),
            amount: Amount::from_units(250),
            fee_charged: Amount::from_stroops(100),
            status,
            result_code: "tx_failed".to_string(),
            created_at: now,
            closed_at: Some(now),
            operations: vec![Operation::payment()],
            balances: vec![],
            sequence: None,
            account_sequence: None,
            memo: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_waits_then_recovering() {
        let h = harness();
        let error = TransactionError::network_congestion("tx-1", CongestionLevel::Medium, 15);

        let id = h.orchestrator.report_error(error);
        assert_eq!(h.orchestrator.get_recovery_status(&id).status, RecoveryStatus::Analyzing);

        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();
        assert_eq!(run.status, RecoveryStatus::Recovering);
        assert_eq!(run.strategy, Some(RecoveryStrategy::WaitAndRetry));
        assert_eq!(run.history[0].0, RecoveryStatus::Analyzing);
        assert_eq!(run.history[1].0, RecoveryStatus::Attempting);

        let result = h.orchestrator.get_recovery_status(&id);
        assert_eq!(result.message, "Retrying after network congestion");
        assert_eq!(result.details.get("retry_delay").map(String::as_str), Some("5000"));
        assert_eq!(h.states.current("tx-1"), Some(TransactionState::Processing));
    }

    #[tokio::test]
    async fn test_insufficient_funds_escalates_with_ticket() {
        let h = harness();
        let error = TransactionError::insufficient_funds(
            "tx-2",
            Amount::from_units(100),
            Amount::from_units(50),
            "XLM",
        );

        let id = h.orchestrator.report_error(error);
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        let result = run.last_result.unwrap();
        assert_eq!(result.status, RecoveryStatus::ManualInterventionRequired);
        assert!(result.message.contains("Insufficient funds"));
        let ticket = h.desk.ticket(&result.details["ticket_id"]).unwrap();
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.required_role, AdminRole::RecoverySpecialist);
        assert_eq!(ticket.error_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallet_retry_exhaustion() {
        let h = harness();
        h.wallet.set_connected(false);
        h.ledger.put_transaction(tx("tx-3", TransactionStatus::Failed));

        let id = h
            .orchestrator
            .report_error(TransactionError::wallet_connection_lost("tx-3", None));
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        assert_eq!(run.status, RecoveryStatus::ManualInterventionRequired);
        assert_eq!(run.attempts, 3);
        let result = run.last_result.unwrap();
        assert_eq!(result.message, "Unable to restore wallet connection");
        assert_eq!(result.details["max_attempts"], "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallet_restored() {
        let h = harness();
        h.ledger.put_transaction(tx("tx-4", TransactionStatus::Success));

        let id = h
            .orchestrator
            .report_error(TransactionError::wallet_connection_lost("tx-4", None));
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        assert_eq!(run.status, RecoveryStatus::Recovered);
        assert_eq!(run.last_result.unwrap().details["attempts"], "1");
    }

    #[tokio::test]
    async fn test_escrow_revalidation() {
        let h = harness();
        h.ledger.put_escrow(EscrowData {
            address: "GESCROW".to_string(),
            status: EscrowStatus::Active,
            balance: Amount::from_units(250),
            required_signatures: 2,
            collected_signatures: 2,
        });

        let id = h.orchestrator.report_error(TransactionError::escrow_verification_failed(
            "tx-5",
            "GESCROW",
            0,
            "escrow_invalid_state",
        ));
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();
        assert_eq!(run.status, RecoveryStatus::Recovered);

        h.ledger.put_escrow(EscrowData {
            address: "GPENDING".to_string(),
            status: EscrowStatus::Pending,
            balance: Amount::from_units(250),
            required_signatures: 2,
            collected_signatures: 1,
        });
        let id = h.orchestrator.report_error(TransactionError::escrow_verification_failed(
            "tx-6",
            "GPENDING",
            1,
            "escrow_unauthorized",
        ));
        let result = h.orchestrator.wait_for_outcome(&id).await.unwrap().last_result.unwrap();
        assert_eq!(result.status, RecoveryStatus::ManualInterventionRequired);
        assert!(result.message.starts_with("Manual escrow verification required. Ticket: MI-"));
    }

    #[tokio::test]
    async fn test_missing_escrow_is_revalidated_not_escalated() {
        let h = harness();

        let id = h.orchestrator.report_error(TransactionError::escrow_verification_failed(
            "tx-5b",
            "GMISSING",
            0,
            "escrow_not_found",
        ));
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        assert_eq!(run.strategy, Some(RecoveryStrategy::Retry));
        assert_eq!(run.attempts, 1);
        let result = run.last_result.unwrap();
        assert_eq!(result.status, RecoveryStatus::ManualInterventionRequired);
        assert!(result.message.starts_with("Manual escrow verification required"));
        assert!(!result.details.contains_key("failed_subsystems"));
    }

    #[tokio::test]
    async fn test_sync_error_rolls_back() {
        let h = harness();
        h.ledger.put_transaction(tx("tx-7", TransactionStatus::Failed));

        let id = h
            .orchestrator
            .report_error(TransactionError::system_synchronization("tx-7", 12, 10));
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        assert_eq!(run.status, RecoveryStatus::Recovered);
        let result = run.last_result.unwrap();
        assert_eq!(result.message, "Transaction rolled back successfully");
        assert!(!result.details["rollback_tx"].is_empty());
        assert_eq!(
            h.states.current("tx-7"),
            Some(TransactionState::Terminal {
                outcome: TerminalOutcome::RolledBack
            })
        );
    }

    #[tokio::test]
    async fn test_critical_error_escalates() {
        let h = harness();
        h.ledger.put_transaction(tx("tx-8", TransactionStatus::Failed));
        let error = TransactionError::system_synchronization("tx-8", 3, 1)
            .with_severity(Severity::Critical);

        let id = h.orchestrator.report_error(error);
        let run = h.orchestrator.wait_for_outcome(&id).await.unwrap();

        assert_eq!(run.status, RecoveryStatus::ManualInterventionRequired);
        assert_eq!(run.strategy, Some(RecoveryStrategy::Escalate));
        assert!(h.ledger.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_recovery() {
        let h = harness();
        let id = h
            .orchestrator
            .report_error(TransactionError::network_congestion("tx-9", CongestionLevel::High, 30));
        tokio::task::yield_now().await;

        assert!(h.orchestrator.cancel_recovery(&id).unwrap());
        assert!(!h.orchestrator.cancel_recovery(&id).unwrap());
        assert!(matches!(
            h.orchestrator.cancel_recovery("err-missing"),
            Err(EngineError::RecoveryNotFound { .. })
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let result = h.orchestrator.get_recovery_status(&id);
        assert_eq!(result.status, RecoveryStatus::Failed);
        assert_eq!(result.message, "Recovery cancelled");
        assert_eq!(h.audit.trail().events_of_type("RECOVERY_CANCELLED").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_active_run_per_transaction() {
        let h = harness();
        let first = h
            .orchestrator
            .report_error(TransactionError::network_congestion("tx-10", CongestionLevel::Medium, 15));
        let second = h
            .orchestrator
            .report_error(TransactionError::network_congestion("tx-10", CongestionLevel::Medium, 15));
        assert_eq!(first, second);
        assert_eq!(h.orchestrator.get_active_recoveries().len(), 1);

        h.orchestrator.wait_for_outcome(&first).await.unwrap();
        assert!(h.orchestrator.get_active_recoveries().is_empty());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let h = harness();
        let result = h.orchestrator.get_recovery_status("err-nope");
        assert_eq!(result.status, RecoveryStatus::NotFound);
        assert_eq!(result.message, "Error err-nope not found in active recoveries");
    }
}
