//! Continuous monitoring tests: polling, hand-off to recovery, retries and
//! watch lifecycle.

use audit::AuditLog;
use chrono::{Duration as ChronoDuration, Utc};
use escrow_recovery::ledger::memory::{InMemoryLedger, StaticWallet};
use escrow_recovery::ledger::{Amount, LedgerError, LedgerTransaction, Operation, TransactionStatus};
use escrow_recovery::monitor::MonitorStatus;
use escrow_recovery::state::{TerminalOutcome, TransactionState};
use escrow_recovery::taxonomy::{CongestionLevel, ErrorKind};
use escrow_recovery::{RecoveryConfig, RecoveryContext, RecoveryStatus};
use std::sync::Arc;

// =============================================================================
// Helpers
// =============================================================================

struct Engine {
    context: Arc<RecoveryContext>,
    ledger: Arc<InMemoryLedger>,
    audit: Arc<AuditLog>,
}

fn engine() -> Engine {
    let ledger = Arc::new(InMemoryLedger::new());
    let audit = Arc::new(AuditLog::in_memory());
    let context = RecoveryContext::new(
        RecoveryConfig::default(),
        ledger.clone(),
        Arc::new(StaticWallet::new(true)),
        audit.clone(),
    )
    .expect("default config is valid");
    Engine {
        context: Arc::new(context),
        ledger,
        audit,
    }
}

/// A transaction closed `latency_secs` after submission.
fn transaction(id: &str, status: TransactionStatus, result_code: &str, latency_secs: i64) -> LedgerTransaction {
    let created = Utc::now() - ChronoDuration::seconds(60);
    LedgerTransaction {
        id: id.to_string(),
        source_account: "GBUYER".to_string(),
        destination_account: "GSELLER".to_string(),
        amount: Amount::from_units(75),
        fee_charged: Amount::from_stroops(100),
        status,
        result_code: result_code.to_string(),
        created_at: created,
        closed_at: (status != TransactionStatus::Pending)
            .then(|| created + ChronoDuration::seconds(latency_secs)),
        operations: vec![Operation::payment()],
        balances: vec![],
        sequence: None,
        account_sequence: None,
        memo: None,
    }
}

fn network_error() -> LedgerError {
    LedgerError::Network {
        details: "connection reset".to_string(),
    }
}

// =============================================================================
// Settlement
// =============================================================================

#[tokio::test]
async fn test_settled_transaction_completes() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-ok", TransactionStatus::Success, "tx_success", 5));

    assert!(e.context.start_monitoring("tx-ok"));
    let status = e.context.monitor().wait_until_settled("tx-ok").await;

    assert_eq!(status, Some(MonitorStatus::Completed));
    assert_eq!(
        e.context.states().current("tx-ok"),
        Some(TransactionState::Terminal {
            outcome: TerminalOutcome::Success
        })
    );
    assert_eq!(e.audit.trail().events_of_type("TRANSACTION_COMPLETED").len(), 1);
    assert_eq!(e.context.monitor().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_transaction_is_polled_until_settled() {
    let e = engine();
    e.ledger.script_transaction(
        "tx-slow",
        vec![
            transaction("tx-slow", TransactionStatus::Pending, "", 0),
            transaction("tx-slow", TransactionStatus::Pending, "", 0),
            transaction("tx-slow", TransactionStatus::Success, "tx_success", 8),
        ],
    );

    e.context.start_monitoring("tx-slow");
    let status = e.context.monitor().wait_until_settled("tx-slow").await;

    assert_eq!(status, Some(MonitorStatus::Completed));
    let entry = e.context.monitor().entry("tx-slow").unwrap();
    assert_eq!(entry.polls, 3);
}

// =============================================================================
// Hand-off to recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_congested_transaction_waits_then_recovering() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-slow-close", TransactionStatus::Failed, "tx_failed", 15));

    e.context.start_monitoring("tx-slow-close");
    let status = e.context.monitor().wait_until_settled("tx-slow-close").await;

    let Some(MonitorStatus::ErrorReported { error_id, error_type }) = status else {
        panic!("expected error hand-off, got {status:?}");
    };
    assert_eq!(error_type, "NetworkCongestion");

    let error = e.context.classifier().current_error("tx-slow-close").unwrap();
    assert!(matches!(
        error.kind,
        ErrorKind::NetworkCongestion {
            congestion_level: CongestionLevel::Medium,
            retry_after_secs: 15,
        }
    ));

    let run = e
        .context
        .orchestrator()
        .wait_for_outcome(&error_id)
        .await
        .unwrap();
    assert_eq!(run.status, RecoveryStatus::Recovering);
    let result = run.last_result.unwrap();
    assert_eq!(result.details.get("retry_delay").map(String::as_str), Some("5000"));
    assert_eq!(
        e.context.states().current("tx-slow-close"),
        Some(TransactionState::Processing)
    );
}

#[tokio::test]
async fn test_unclassified_failure_becomes_blockchain_error() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-fail", TransactionStatus::Failed, "tx_failed", 4));

    e.context.start_monitoring("tx-fail");
    let status = e.context.monitor().wait_until_settled("tx-fail").await;

    let Some(MonitorStatus::ErrorReported { error_id, error_type }) = status else {
        panic!("expected error hand-off, got {status:?}");
    };
    assert_eq!(error_type, "Blockchain");

    let run = e
        .context
        .orchestrator()
        .wait_for_outcome(&error_id)
        .await
        .unwrap();
    assert_eq!(run.status, RecoveryStatus::Recovered);
    assert_eq!(e.ledger.submitted().len(), 1);
}

// =============================================================================
// Transient failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-flaky", TransactionStatus::Success, "tx_success", 5));
    e.ledger.fail_next("get_transaction", network_error());
    e.ledger.fail_next("get_transaction", network_error());

    e.context.start_monitoring("tx-flaky");
    let status = e.context.monitor().wait_until_settled("tx-flaky").await;

    assert_eq!(status, Some(MonitorStatus::Completed));
    assert_eq!(e.ledger.call_count("get_transaction"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_timeout() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-down", TransactionStatus::Pending, "", 0));
    for _ in 0..3 {
        e.ledger.fail_next("get_transaction", network_error());
    }

    e.context.start_monitoring("tx-down");
    let status = e.context.monitor().wait_until_settled("tx-down").await;

    let Some(MonitorStatus::MaxRetriesReached { error_id }) = status else {
        panic!("expected retry exhaustion, got {status:?}");
    };
    let run = e.context.orchestrator().run(&error_id).unwrap();
    assert!(matches!(run.error.kind, ErrorKind::Timeout { .. }));
    assert_eq!(e.audit.trail().events_of_type("MONITOR_MAX_RETRIES").len(), 1);
}

// =============================================================================
// Watch lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_leaves_one_watch() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-pending", TransactionStatus::Pending, "", 0));

    let first = tokio::spawn({
        let context = e.context.clone();
        async move { context.start_monitoring("tx-pending") }
    });
    let second = tokio::spawn({
        let context = e.context.clone();
        async move { context.start_monitoring("tx-pending") }
    });
    let started = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(started.iter().filter(|s| **s).count(), 1);
    assert_eq!(e.context.monitor().active_count(), 1);
    assert_eq!(e.audit.trail().events_of_type("MONITOR_DUPLICATE").len(), 1);

    assert!(e.context.stop_monitoring("tx-pending"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_is_noop() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-pending", TransactionStatus::Pending, "", 0));
    e.context.start_monitoring("tx-pending");

    assert!(e.context.stop_monitoring("tx-pending"));
    assert!(!e.context.stop_monitoring("tx-pending"));

    assert!(e.context.monitor().entry("tx-pending").is_none());
    assert_eq!(e.context.monitor().active_count(), 0);
    assert_eq!(e.audit.trail().events_of_type("MONITOR_STOPPED").len(), 1);
}

#[tokio::test]
async fn test_settled_watch_can_be_restarted() {
    let e = engine();
    e.ledger
        .put_transaction(transaction("tx-again", TransactionStatus::Success, "tx_success", 5));

    assert!(e.context.start_monitoring("tx-again"));
    e.context.monitor().wait_until_settled("tx-again").await;

    assert!(e.context.start_monitoring("tx-again"));
    e.context.stop_monitoring("tx-again");
}
