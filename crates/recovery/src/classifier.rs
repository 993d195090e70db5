//! Error classifier.
//!
//! Turns a raw ledger transaction into at most one [`TransactionError`].
//! Rules are evaluated in a fixed priority order; the first match wins:
//!
//! 1. wallet not connected → `WalletConnectionLost`
//! 2. latency above threshold or a too-late / op-failed marker → `NetworkCongestion`
//! 3. underfunded / low-reserve marker → `InsufficientFunds`
//! 4. contract failure marker on an `invoke_contract` operation → `SmartContractFailure`
//! 5. escrow failure marker on an escrow operation → `EscrowVerificationFailed`
//! 6. bad sequence marker → `SystemSynchronization`
//!
//! Successful transactions never classify as errors. The latest error per
//! transaction is kept in an observable registry.

use audit::{AuditEvent, AuditSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ledger::{call_with_timeout, LedgerClient, LedgerTransaction, WalletConnectivity};
use crate::store::{ObservableStore, Snapshot};
use crate::taxonomy::{CongestionLevel, TransactionError};

const CONGESTION_MARKERS: &[&str] = &["tx_too_late", "op_failed"];
const FUNDS_MARKERS: &[&str] = &["tx_insufficient_balance", "op_underfunded", "op_low_reserve"];
const CONTRACT_MARKERS: &[&str] = &["op_invalid_code", "op_execution_failed", "op_exceeds_limit"];
const ESCROW_MARKERS: &[&str] = &["escrow_invalid_state", "escrow_not_found", "escrow_unauthorized"];
const SEQUENCE_MARKERS: &[&str] = &["tx_bad_seq"];

/// Native asset code used in funds messages.
const NATIVE_CURRENCY: &str = "XLM";

fn first_marker<'a>(tx: &LedgerTransaction, markers: &[&'a str]) -> Option<&'a str> {
    markers.iter().copied().find(|m| tx.has_marker(m))
}

/// Bucket a ledger latency into a congestion level.
#[must_use]
pub fn congestion_level(latency: Duration) -> CongestionLevel {
    match latency.as_millis() {
        ms if ms > 30_000 => CongestionLevel::Extreme,
        ms if ms > 20_000 => CongestionLevel::High,
        ms if ms > 10_000 => CongestionLevel::Medium,
        _ => CongestionLevel::Low,
    }
}

/// Suggested wait before resubmitting, in seconds.
#[must_use]
pub fn retry_after_secs(latency: Duration) -> u64 {
    match latency.as_millis() {
        ms if ms > 30_000 => 60,
        ms if ms > 20_000 => 30,
        _ => 15,
    }
}

/// Pure classification of one transaction.
///
/// A successful transaction is never an error, even with the wallet
/// disconnected; the wallet rule only applies to unsettled or failed ones.
#[must_use]
pub fn classify_transaction(
    tx: &LedgerTransaction,
    wallet_connected: bool,
    congestion_threshold: Duration,
) -> Option<TransactionError> {
    if tx.is_successful() {
        return None;
    }

    if !wallet_connected {
        return Some(TransactionError::wallet_connection_lost(&tx.id, None));
    }

    let latency = tx.latency().unwrap_or_default();
    if latency > congestion_threshold || first_marker(tx, CONGESTION_MARKERS).is_some() {
        return Some(TransactionError::network_congestion(
            &tx.id,
            congestion_level(latency),
            retry_after_secs(latency),
        ));
    }

    if first_marker(tx, FUNDS_MARKERS).is_some() {
        return Some(TransactionError::insufficient_funds(
            &tx.id,
            tx.fee_charged,
            tx.native_balance(),
            NATIVE_CURRENCY,
        ));
    }

    if let (Some(code), Some(op)) = (first_marker(tx, CONTRACT_MARKERS), tx.contract_invocation()) {
        let contract = op
            .contract_address
            .as_deref()
            .or(op.source_account.as_deref())
            .unwrap_or("unknown");
        let function = op.function_name.as_deref().unwrap_or("unknown");
        return Some(TransactionError::smart_contract_failure(
            &tx.id, contract, code, function,
        ));
    }

    if let (Some(code), Some(op)) = (first_marker(tx, ESCROW_MARKERS), tx.escrow_operation()) {
        let escrow = op.escrow_address.as_deref().unwrap_or("unknown");
        return Some(TransactionError::escrow_verification_failed(
            &tx.id, escrow, 0, code,
        ));
    }

    if first_marker(tx, SEQUENCE_MARKERS).is_some() {
        return Some(TransactionError::system_synchronization(
            &tx.id,
            tx.account_sequence.unwrap_or_default(),
            tx.sequence.unwrap_or_default(),
        ));
    }

    None
}

/// Classifier with an observable error registry keyed by transaction id.
pub struct ErrorClassifier {
    ledger: Arc<dyn LedgerClient>,
    wallet: Arc<dyn WalletConnectivity>,
    audit: Arc<dyn AuditSink>,
    registry: ObservableStore<String, TransactionError>,
    congestion_threshold: Duration,
    call_timeout: Duration,
}

impl ErrorClassifier {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletConnectivity>,
        audit: Arc<dyn AuditSink>,
        congestion_threshold: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            wallet,
            audit,
            registry: ObservableStore::new(),
            congestion_threshold,
            call_timeout,
        }
    }

    /// Classify an already fetched transaction and record any error found.
    pub fn inspect(&self, tx: &LedgerTransaction, wallet_connected: bool) -> Option<TransactionError> {
        let error = classify_transaction(tx, wallet_connected, self.congestion_threshold)?;
        self.record(error.clone());
        Some(error)
    }

    /// Fetch a transaction and classify it.
    ///
    /// A failed lookup is itself reported as an `Unknown` error of HIGH
    /// severity rather than propagated.
    pub async fn analyze_transaction(&self, transaction_id: &str) -> Option<TransactionError> {
        let fetched = call_with_timeout(
            self.call_timeout,
            "get_transaction",
            self.ledger.get_transaction(transaction_id),
        )
        .await;

        match fetched {
            Ok(tx) => {
                let connected = self.wallet.is_connected().await;
                let error = self.inspect(&tx, connected);
                if error.is_none() {
                    debug!(transaction_id, "No error detected");
                }
                error
            }
            Err(e) => {
                warn!(transaction_id, error = %e, "Transaction analysis failed");
                self.audit.log_event(
                    AuditEvent::new("ERROR_DETECTION_FAILED", "Failed to analyze transaction")
                        .with("transaction_id", transaction_id)
                        .with("error", &e),
                );
                let error = TransactionError::unknown(
                    transaction_id,
                    format!("Failed to analyze transaction: {e}"),
                    Some(format!("{e:?}")),
                );
                self.registry.insert(transaction_id.to_string(), error.clone());
                Some(error)
            }
        }
    }

    /// Record an error as the latest for its transaction.
    pub fn record(&self, error: TransactionError) {
        info!(
            transaction_id = %error.transaction_id,
            error_type = error.kind_name(),
            severity = %error.severity,
            "Transaction error detected"
        );
        self.audit.log_event(
            AuditEvent::new("ERROR_DETECTED", "Transaction error detected")
                .with("transaction_id", &error.transaction_id)
                .with("error_id", &error.id)
                .with("error_type", error.kind_name())
                .with("severity", error.severity),
        );
        self.registry.insert(error.transaction_id.clone(), error);
    }

    /// Latest classified error for a transaction.
    pub fn current_error(&self, transaction_id: &str) -> Option<TransactionError> {
        self.registry.get(&transaction_id.to_string())
    }

    /// Remove a transaction's error. Returns whether one was present.
    pub fn clear_error(&self, transaction_id: &str) -> bool {
        let removed = self.registry.remove(&transaction_id.to_string()).is_some();
        if removed {
            self.audit.log_event(
                AuditEvent::new("ERROR_CLEARED", "Transaction error cleared")
                    .with("transaction_id", transaction_id),
            );
        }
        removed
    }

    pub fn errors(&self) -> Snapshot<String, TransactionError> {
        self.registry.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, TransactionError>> {
        self.registry.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::{
        Amount, Balance, LedgerError, MockWalletConnectivity, Operation, TransactionStatus,
    };
    use crate::taxonomy::{ErrorKind, Severity};
    use audit::AuditLog;
    use chrono::{TimeZone, Utc};

    const THRESHOLD: Duration = Duration::from_secs(10);

    fn failed_tx(result_code: &str, latency_ms: i64) -> LedgerTransaction {
        let created = Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap();
        LedgerTransaction {
            id: "tx-1".to_string(),
            source_account: "GSRC".to_string(),
            destination_account: "GDST".to_string(),
            amount: Amount::from_units(100),
            fee_charged: Amount::from_units(100),
            status: TransactionStatus::Failed,
            result_code: result_code.to_string(),
            created_at: created,
            closed_at: Some(created + chrono::Duration::milliseconds(latency_ms)),
            operations: vec![Operation::payment()],
            balances: vec![Balance {
                asset_type: "native".to_string(),
                balance: Amount::from_units(50),
            }],
            sequence: Some(40),
            account_sequence: Some(42),
            memo: None,
        }
    }

    #[test]
    fn test_congestion_buckets() {
        assert_eq!(congestion_level(Duration::from_millis(15_000)), CongestionLevel::Medium);
        assert_eq!(congestion_level(Duration::from_millis(10_000)), CongestionLevel::Low);
        assert_eq!(congestion_level(Duration::from_millis(25_000)), CongestionLevel::High);
        assert_eq!(congestion_level(Duration::from_millis(30_001)), CongestionLevel::Extreme);
        assert_eq!(retry_after_secs(Duration::from_millis(31_000)), 60);
        assert_eq!(retry_after_secs(Duration::from_millis(21_000)), 30);
        assert_eq!(retry_after_secs(Duration::from_millis(1_000)), 15);
    }

    #[test]
    fn test_latency_15s_is_medium_congestion() {
        let tx = failed_tx("tx_failed", 15_000);
        let error = classify_transaction(&tx, true, THRESHOLD).unwrap();
        match error.kind {
            ErrorKind::NetworkCongestion {
                congestion_level,
                retry_after_secs,
            } => {
                assert_eq!(congestion_level, CongestionLevel::Medium);
                assert_eq!(retry_after_secs, 15);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_wallet_check_has_priority() {
        let tx = failed_tx("tx_failed,op_underfunded", 20_000);
        let error = classify_transaction(&tx, false, THRESHOLD).unwrap();
        assert_eq!(error.kind_name(), "WalletConnectionLost");
    }

    #[test]
    fn test_insufficient_funds_uses_fee_and_native_balance() {
        let tx = failed_tx("tx_failed,op_underfunded", 2_000);
        let error = classify_transaction(&tx, true, THRESHOLD).unwrap();
        assert_eq!(
            error.kind,
            ErrorKind::InsufficientFunds {
                required: Amount::from_units(100),
                available: Amount::from_units(50),
                currency: "XLM".to_string(),
            }
        );
        assert!(error.message.contains("Insufficient funds"));
    }

    #[test]
    fn test_contract_marker_requires_invoke_operation() {
        let mut tx = failed_tx("tx_failed,op_execution_failed", 1_000);
        assert!(classify_transaction(&tx, true, THRESHOLD).is_none());

        tx.operations = vec![Operation::invoke_contract("CESCROWAPP", "release")];
        let error = classify_transaction(&tx, true, THRESHOLD).unwrap();
        assert_eq!(
            error.kind,
            ErrorKind::SmartContractFailure {
                contract_address: "CESCROWAPP".to_string(),
                error_code: "op_execution_failed".to_string(),
                function_name: "release".to_string(),
            }
        );
    }

    #[test]
    fn test_escrow_and_sequence_rules() {
        let mut tx = failed_tx("tx_failed,escrow_unauthorized", 1_000);
        tx.operations = vec![Operation::manage_escrow("GESCROW")];
        let error = classify_transaction(&tx, true, THRESHOLD).unwrap();
        assert_eq!(error.kind_name(), "EscrowVerificationFailed");
        assert_eq!(error.severity, Severity::High);

        let tx = failed_tx("tx_bad_seq", 1_000);
        let error = classify_transaction(&tx, true, THRESHOLD).unwrap();
        assert_eq!(
            error.kind,
            ErrorKind::SystemSynchronization {
                current_seq: 42,
                tx_seq: 40
            }
        );
    }

    #[test]
    fn test_successful_transaction_is_not_an_error() {
        let mut tx = failed_tx("tx_success", 45_000);
        tx.status = TransactionStatus::Success;
        assert!(classify_transaction(&tx, false, THRESHOLD).is_none());
    }

    #[tokio::test]
    async fn test_lookup_failure_becomes_unknown_high() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fail_next(
            "get_transaction",
            LedgerError::Network {
                details: "connection reset".to_string(),
            },
        );
        let mut wallet = MockWalletConnectivity::new();
        wallet.expect_is_connected().never();
        let audit = Arc::new(AuditLog::in_memory());
        let classifier = ErrorClassifier::new(
            ledger,
            Arc::new(wallet),
            audit.clone(),
            THRESHOLD,
            Duration::from_secs(1),
        );

        let error = classifier.analyze_transaction("tx-404").await.unwrap();
        assert_eq!(error.kind_name(), "Unknown");
        assert_eq!(error.severity, Severity::High);
        assert!(error.message.starts_with("Failed to analyze transaction"));
        assert_eq!(audit.trail().events_of_type("ERROR_DETECTION_FAILED").len(), 1);
        assert!(classifier.current_error("tx-404").is_some());
    }

    #[tokio::test]
    async fn test_registry_replace_and_clear() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.put_transaction(failed_tx("tx_failed,op_underfunded", 1_000));
        let mut wallet = MockWalletConnectivity::new();
        wallet.expect_is_connected().returning(|| true);
        let audit = Arc::new(AuditLog::in_memory());
        let classifier = ErrorClassifier::new(
            ledger,
            Arc::new(wallet),
            audit.clone(),
            THRESHOLD,
            Duration::from_secs(1),
        );

        let first = classifier.analyze_transaction("tx-1").await.unwrap();
        let second = classifier.analyze_transaction("tx-1").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(classifier.errors().len(), 1);
        assert_eq!(classifier.current_error("tx-1").unwrap().id, second.id);

        assert!(classifier.clear_error("tx-1"));
        assert!(!classifier.clear_error("tx-1"));
        assert!(classifier.current_error("tx-1").is_none());
        assert_eq!(audit.trail().events_of_type("ERROR_DETECTED").len(), 2);
        assert_eq!(audit.trail().events_of_type("ERROR_CLEARED").len(), 1);
    }
}
