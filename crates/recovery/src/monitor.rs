//! Continuous transaction monitoring.
//!
//! One background watch per transaction id polls the ledger until the
//! transaction settles. Errors are classified and handed to the
//! orchestrator; transient lookup failures are retried with the shared
//! backoff policy.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classifier::ErrorClassifier;
use crate::config::{RecoveryConfig, RetryConfig};
use crate::ledger::{call_with_timeout, LedgerClient, WalletConnectivity};
use crate::orchestrator::RecoveryOrchestrator;
use crate::state::{TerminalOutcome, TransactionState, TransactionStateManager};
use crate::store::{ObservableStore, Snapshot};
use crate::taxonomy::TransactionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MonitorStatus {
    Watching,
    Completed,
    ErrorReported { error_id: String, error_type: String },
    MaxRetriesReached { error_id: String },
}

impl MonitorStatus {
    #[must_use]
    pub fn is_watching(&self) -> bool {
        matches!(self, Self::Watching)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub status: MonitorStatus,
    pub polls: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    generation: u64,
}

/// Collaborators of the monitor.
pub struct MonitorDeps {
    pub ledger: Arc<dyn LedgerClient>,
    pub wallet: Arc<dyn WalletConnectivity>,
    pub classifier: Arc<ErrorClassifier>,
    pub orchestrator: Arc<RecoveryOrchestrator>,
    pub states: Arc<TransactionStateManager>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct TransactionMonitor {
    deps: MonitorDeps,
    retry: RetryConfig,
    poll_interval: Duration,
    call_timeout: Duration,
    watches: ObservableStore<String, MonitorEntry>,
    cancellations: Mutex<HashMap<String, (u64, watch::Sender<bool>)>>,
    generations: AtomicU64,
}

async fn cancelled(mut signal: watch::Receiver<bool>) {
    let _ = signal.wait_for(|cancelled| *cancelled).await;
}

impl TransactionMonitor {
    pub fn new(deps: MonitorDeps, config: &RecoveryConfig) -> Self {
        Self {
            deps,
            retry: config.retry.clone(),
            poll_interval: config.monitor.poll_interval,
            call_timeout: config.ledger_call_timeout,
            watches: ObservableStore::new(),
            cancellations: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    /// Start watching a transaction. Returns `false` when a watch for it is
    /// already running.
    pub fn start_monitoring(self: &Arc<Self>, transaction_id: &str) -> bool {
        let key = transaction_id.to_string();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let mut cancellations = self.cancellations.lock();
        let started = self.watches.update(|watches| {
            if watches.get(&key).is_some_and(|entry| entry.status.is_watching()) {
                return false;
            }
            watches.insert(
                key.clone(),
                MonitorEntry {
                    status: MonitorStatus::Watching,
                    polls: 0,
                    started_at: Utc::now(),
                    generation,
                },
            );
            true
        });

        if !started {
            drop(cancellations);
            debug!(transaction_id, "Transaction already monitored");
            self.deps.audit.log_event(
                AuditEvent::new("MONITOR_DUPLICATE", "Transaction already being monitored")
                    .with("transaction_id", transaction_id),
            );
            return false;
        }

        let (cancel, signal) = watch::channel(false);
        cancellations.insert(key.clone(), (generation, cancel));
        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch_transaction(key, generation, signal).await });
        drop(cancellations);

        info!(transaction_id, "Started monitoring transaction");
        self.deps.audit.log_event(
            AuditEvent::new("MONITOR_STARTED", "Started monitoring transaction")
                .with("transaction_id", transaction_id),
        );
        true
    }

    /// Stop watching and drop the entry. No-op for unknown ids.
    pub fn stop_monitoring(&self, transaction_id: &str) -> bool {
        let removed = {
            let mut cancellations = self.cancellations.lock();
            if let Some((_, cancel)) = cancellations.remove(transaction_id) {
                let _ = cancel.send(true);
            }
            self.watches.remove(&transaction_id.to_string()).is_some()
        };
        if removed {
            info!(transaction_id, "Stopped monitoring transaction");
            self.deps.audit.log_event(
                AuditEvent::new("MONITOR_STOPPED", "Stopped monitoring transaction")
                    .with("transaction_id", transaction_id),
            );
        }
        removed
    }

    pub fn status(&self, transaction_id: &str) -> Option<MonitorStatus> {
        self.watches
            .get(&transaction_id.to_string())
            .map(|entry| entry.status)
    }

    pub fn entry(&self, transaction_id: &str) -> Option<MonitorEntry> {
        self.watches.get(&transaction_id.to_string())
    }

    /// Number of watches still polling.
    pub fn active_count(&self) -> usize {
        self.watches
            .snapshot()
            .values()
            .filter(|entry| entry.status.is_watching())
            .count()
    }

    pub fn watches(&self) -> Snapshot<String, MonitorEntry> {
        self.watches.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, MonitorEntry>> {
        self.watches.subscribe()
    }

    /// Wait until the watch settles or is removed.
    pub async fn wait_until_settled(&self, transaction_id: &str) -> Option<MonitorStatus> {
        let mut watches = self.watches.subscribe();
        let key = transaction_id.to_string();
        let snapshot = watches
            .wait_for(|watches| !watches.get(&key).is_some_and(|e| e.status.is_watching()))
            .await
            .ok()?;
        snapshot.get(&key).map(|entry| entry.status.clone())
    }

    async fn watch_transaction(
        self: Arc<Self>,
        transaction_id: String,
        generation: u64,
        signal: watch::Receiver<bool>,
    ) {
        let outcome = tokio::select! {
            status = self.poll_until_settled(&transaction_id, generation) => Some(status),
            () = cancelled(signal) => None,
        };
        let Some(status) = outcome else {
            debug!(transaction_id = %transaction_id, "Monitor cancelled");
            return;
        };

        {
            let mut cancellations = self.cancellations.lock();
            if cancellations
                .get(&transaction_id)
                .is_some_and(|(owner, _)| *owner == generation)
            {
                cancellations.remove(&transaction_id);
            }
        }
        self.watches.modify(&transaction_id, |entry| {
            if entry.generation == generation {
                entry.status = status;
            }
        });
    }

    async fn poll_until_settled(&self, transaction_id: &str, generation: u64) -> MonitorStatus {
        self.deps.states.track(transaction_id);
        self.advance_state(transaction_id, TransactionState::Processing);

        let mut failures = 0u32;
        loop {
            self.watches.modify(&transaction_id.to_string(), |entry| {
                if entry.generation == generation {
                    entry.polls += 1;
                }
            });

            let fetched = call_with_timeout(
                self.call_timeout,
                "get_transaction",
                self.deps.ledger.get_transaction(transaction_id),
            )
            .await;

            match fetched {
                Ok(tx) => {
                    failures = 0;
                    let connected = self.deps.wallet.is_connected().await;
                    if let Some(error) = self.deps.classifier.inspect(&tx, connected) {
                        return self.hand_off(error);
                    }
                    if tx.is_successful() {
                        info!(transaction_id, "Transaction completed");
                        for next in [
                            TransactionState::Verifying,
                            TransactionState::Confirmed,
                            TransactionState::Terminal {
                                outcome: TerminalOutcome::Success,
                            },
                        ] {
                            self.advance_state(transaction_id, next);
                        }
                        self.deps.audit.log_event(
                            AuditEvent::new("TRANSACTION_COMPLETED", "Monitored transaction completed")
                                .with("transaction_id", transaction_id),
                        );
                        return MonitorStatus::Completed;
                    }
                    if tx.is_failed() {
                        let error = TransactionError::blockchain(transaction_id, &tx.result_code);
                        self.deps.classifier.record(error.clone());
                        return self.hand_off(error);
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.retry.should_retry(failures) {
                        warn!(transaction_id, failures, error = %e, "Max monitoring retries reached");
                        let timeout_ms =
                            u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX);
                        let error =
                            TransactionError::timeout(transaction_id, "get_transaction", timeout_ms);
                        self.deps.classifier.record(error.clone());
                        let error_id = self.deps.orchestrator.report_error(error);
                        self.deps.audit.log_event(
                            AuditEvent::new("MONITOR_MAX_RETRIES", "Monitoring retries exhausted")
                                .with("transaction_id", transaction_id)
                                .with("error_id", &error_id)
                                .with("failures", failures),
                        );
                        return MonitorStatus::MaxRetriesReached { error_id };
                    }
                    let delay = self.retry.delay_for_attempt(failures);
                    debug!(transaction_id, failures, delay_ms = delay.as_millis(), error = %e, "Retrying transaction lookup");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let error = TransactionError::unknown(
                        transaction_id,
                        format!("Failed to analyze transaction: {e}"),
                        None,
                    );
                    self.deps.classifier.record(error.clone());
                    return self.hand_off(error);
                }
            }
        }
    }

    fn hand_off(&self, error: TransactionError) -> MonitorStatus {
        let error_type = error.kind_name().to_string();
        let error_id = self.deps.orchestrator.report_error(error);
        MonitorStatus::ErrorReported {
            error_id,
            error_type,
        }
    }

    fn advance_state(&self, transaction_id: &str, next: TransactionState) {
        if let Err(e) = self.deps.states.update_state(transaction_id, next) {
            debug!(transaction_id, error = %e, "Transaction state unchanged");
        }
    }
}
