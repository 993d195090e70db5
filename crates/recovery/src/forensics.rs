//! Forensics and risk assessment.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::classifier::ErrorClassifier;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{EscrowStatus, LedgerClient, NetworkStatus, WalletConnectivity};
use crate::patterns::{risk_score, PatternSignal, PatternTracker, RiskLevel};
use crate::store::ObservableStore;
use crate::system::{SystemState, WalletStatus};
use crate::taxonomy::{ErrorKind, Severity, TransactionError};

/// Assessment of one classified error against the live system state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicsReport {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub error: TransactionError,
    pub is_recoverable: bool,
    pub requires_user_action: bool,
    pub risk_level: RiskLevel,
    pub recommended_actions: Vec<String>,
    pub system_state: SystemState,
    pub anomaly_count: usize,
    pub frequency: usize,
}

fn type_recommendations(kind: &ErrorKind) -> &'static [&'static str] {
    match kind {
        ErrorKind::NetworkCongestion { .. } => &[
            "Wait for network congestion to decrease",
            "Retry transaction with higher fee",
            "Consider breaking down into smaller transactions",
        ],
        ErrorKind::InsufficientFunds { .. } => &[
            "Top up the source account",
            "Check wallet balance against amount plus fees",
        ],
        ErrorKind::SmartContractFailure { .. } => &[
            "Verify contract state preconditions",
            "Check parameter validation",
            "Review contract execution logs",
        ],
        ErrorKind::WalletConnectionLost { .. } => &[
            "Verify wallet connection",
            "Check wallet permissions",
        ],
        ErrorKind::EscrowVerificationFailed { .. } => &[
            "Verify escrow account balances",
            "Check participant signatures",
            "Review escrow release conditions",
        ],
        ErrorKind::SystemSynchronization { .. } => &[
            "Refresh the account sequence number",
            "Resubmit with the current sequence",
        ],
        ErrorKind::Blockchain { .. } => &[
            "Review blockchain state",
            "Check transaction parameters",
        ],
        ErrorKind::Timeout { .. } => &["Retry transaction", "Check network conditions"],
        ErrorKind::Unknown { .. } => &[
            "Contact system administrator",
            "Review system logs for additional context",
        ],
    }
}

fn state_recommendations(state: &SystemState) -> Vec<&'static str> {
    let mut actions = Vec::new();
    if state.network_status != NetworkStatus::Healthy {
        actions.push("Wait for network stability");
    }
    if state.wallet_status != WalletStatus::Connected {
        actions.push("Reconnect wallet");
    }
    if matches!(state.escrow_status, EscrowStatus::Locked | EscrowStatus::Error) {
        actions.push("Verify escrow contract status");
    }
    if !state.blockchain_state.is_healthy() {
        actions.push("Wait for blockchain congestion to decrease");
    }
    actions
}

/// Pure assessment of `error` under `state` with the given pattern inputs.
#[must_use]
pub fn assess(error: &TransactionError, state: &SystemState, signal: PatternSignal) -> ForensicsReport {
    let critical = error.severity == Severity::Critical;
    let failed_subsystem = state.has_failed_subsystem();

    let is_recoverable = !critical && !failed_subsystem && error.recoverable;

    let requires_user_action = matches!(
        error.kind,
        ErrorKind::WalletConnectionLost { .. } | ErrorKind::EscrowVerificationFailed { .. }
    ) || state.wallet_status == WalletStatus::Disconnected
        || state.escrow_status == EscrowStatus::Locked
        || error.severity >= Severity::High;

    let mut risk_level = RiskLevel::from_score(risk_score(
        error.severity,
        signal.anomaly_count,
        signal.frequency,
    ));
    if critical || failed_subsystem {
        risk_level = RiskLevel::Critical;
    } else if error.severity == Severity::High
        || matches!(
            state.network_status,
            NetworkStatus::Degraded | NetworkStatus::Congested
        )
    {
        risk_level = risk_level.max(RiskLevel::High);
    }

    let mut recommended_actions: Vec<String> = type_recommendations(&error.kind)
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    for action in state_recommendations(state) {
        if !recommended_actions.iter().any(|a| a == action) {
            recommended_actions.push(action.to_string());
        }
    }

    ForensicsReport {
        transaction_id: error.transaction_id.clone(),
        timestamp: Utc::now(),
        error: error.clone(),
        is_recoverable,
        requires_user_action,
        risk_level,
        recommended_actions,
        system_state: state.clone(),
        anomaly_count: signal.anomaly_count,
        frequency: signal.frequency,
    }
}

/// Escrow account an error refers to, if any.
#[must_use]
pub fn escrow_of(error: &TransactionError) -> Option<&str> {
    match &error.kind {
        ErrorKind::EscrowVerificationFailed { escrow_address, .. } => Some(escrow_address),
        _ => None,
    }
}

/// Produces and keeps the latest [`ForensicsReport`] per transaction.
pub struct ForensicsAnalyzer {
    ledger: Arc<dyn LedgerClient>,
    wallet: Arc<dyn WalletConnectivity>,
    classifier: Arc<ErrorClassifier>,
    patterns: Arc<PatternTracker>,
    audit: Arc<dyn AuditSink>,
    reports: ObservableStore<String, ForensicsReport>,
    call_timeout: Duration,
}

impl ForensicsAnalyzer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletConnectivity>,
        classifier: Arc<ErrorClassifier>,
        patterns: Arc<PatternTracker>,
        audit: Arc<dyn AuditSink>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            wallet,
            classifier,
            patterns,
            audit,
            reports: ObservableStore::new(),
            call_timeout,
        }
    }

    /// Analyze the latest classified error of a transaction.
    pub async fn analyze(&self, transaction_id: &str) -> EngineResult<ForensicsReport> {
        let error = self
            .classifier
            .current_error(transaction_id)
            .ok_or_else(|| EngineError::ErrorNotFound {
                transaction_id: transaction_id.to_string(),
            })?;
        Ok(self.assess_error(&error).await)
    }

    /// Capture a fresh system state and assess `error` against it.
    pub async fn assess_error(&self, error: &TransactionError) -> ForensicsReport {
        let state = SystemState::capture(
            self.ledger.as_ref(),
            self.wallet.as_ref(),
            escrow_of(error),
            self.call_timeout,
        )
        .await;
        self.assess_with_state(error, &state)
    }

    /// Assess against an already captured state and store the report.
    pub fn assess_with_state(&self, error: &TransactionError, state: &SystemState) -> ForensicsReport {
        let report = assess(error, state, self.patterns.signal(error.kind_name()));

        info!(
            transaction_id = %report.transaction_id,
            error_type = error.kind_name(),
            risk_level = %report.risk_level,
            is_recoverable = report.is_recoverable,
            "Forensics report generated"
        );
        self.audit.log_event(
            AuditEvent::new("FORENSICS_REPORT_GENERATED", "Generated forensics report")
                .with("transaction_id", &report.transaction_id)
                .with("error_type", error.kind_name())
                .with("is_recoverable", report.is_recoverable)
                .with("risk_level", report.risk_level)
                .with("network_status", state.network_status.as_str())
                .with("wallet_status", state.wallet_status.as_str())
                .with("escrow_status", state.escrow_status.as_str()),
        );

        self.reports
            .insert(report.transaction_id.clone(), report.clone());
        report
    }

    /// Latest report for a transaction.
    pub fn latest_report(&self, transaction_id: &str) -> Option<ForensicsReport> {
        self.reports.get(&transaction_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::{Amount, MockWalletConnectivity, NetworkState};
    use crate::taxonomy::CongestionLevel;
    use audit::AuditLog;

    fn funds() -> TransactionError {
        TransactionError::insufficient_funds(
            "tx-1",
            Amount::from_units(100),
            Amount::from_units(50),
            "XLM",
        )
    }

    #[test]
    fn test_recoverable_follows_error_flag_when_healthy() {
        let report = assess(
            &TransactionError::network_congestion("tx", CongestionLevel::Low, 15),
            &SystemState::healthy(),
            PatternSignal::default(),
        );
        assert!(report.is_recoverable);
        assert!(!report.requires_user_action);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert_eq!(report.recommended_actions[0], "Wait for network congestion to decrease");

        let report = assess(&funds(), &SystemState::healthy(), PatternSignal::default());
        assert!(!report.is_recoverable);
        assert!(report.requires_user_action);
        assert_eq!(report.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_failed_subsystem_forces_critical() {
        let mut state = SystemState::healthy();
        state.escrow_status = EscrowStatus::Locked;
        let error = TransactionError::wallet_connection_lost("tx", None);

        let report = assess(&error, &state, PatternSignal::default());

        assert!(!report.is_recoverable);
        assert!(report.requires_user_action);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert!(report
            .recommended_actions
            .contains(&"Verify escrow contract status".to_string()));
    }

    #[test]
    fn test_degraded_network_raises_risk_and_recommends_waiting() {
        let mut state = SystemState::healthy();
        state.network_status = NetworkStatus::Degraded;
        let error = TransactionError::system_synchronization("tx", 4, 3);

        let report = assess(&error, &state, PatternSignal::default());

        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(report.is_recoverable);
        assert!(report
            .recommended_actions
            .contains(&"Wait for network stability".to_string()));
    }

    #[test]
    fn test_pattern_signal_contributes_to_score() {
        let error = TransactionError::system_synchronization("tx", 4, 3);
        let quiet = assess(&error, &SystemState::healthy(), PatternSignal::default());
        let noisy = assess(
            &error,
            &SystemState::healthy(),
            PatternSignal {
                frequency: 10,
                anomaly_count: 2,
            },
        );
        assert_eq!(quiet.risk_level, RiskLevel::Medium);
        assert_eq!(noisy.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_analyze_requires_classified_error() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_network_state(NetworkState {
            status: NetworkStatus::Offline,
            latency_ms: 0,
        });
        let mut wallet = MockWalletConnectivity::new();
        wallet.expect_is_connected().returning(|| true);
        let wallet: Arc<dyn WalletConnectivity> = Arc::new(wallet);
        let audit = Arc::new(AuditLog::in_memory());
        let classifier = Arc::new(ErrorClassifier::new(
            ledger.clone(),
            wallet.clone(),
            audit.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));
        let patterns = Arc::new(PatternTracker::new(Duration::from_secs(3600), audit.clone()));
        let forensics = ForensicsAnalyzer::new(
            ledger,
            wallet,
            classifier.clone(),
            patterns,
            audit.clone(),
            Duration::from_secs(1),
        );

        assert!(matches!(
            forensics.analyze("tx-1").await,
            Err(EngineError::ErrorNotFound { .. })
        ));

        classifier.record(funds());
        let report = forensics.analyze("tx-1").await.unwrap();
        assert_eq!(report.system_state.network_status, NetworkStatus::Offline);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert_eq!(forensics.latest_report("tx-1").unwrap().error.id, report.error.id);
        assert_eq!(
            audit.trail().events_of_type("FORENSICS_REPORT_GENERATED").len(),
            1
        );
    }
}
