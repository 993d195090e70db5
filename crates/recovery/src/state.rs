//! Per-transaction lifecycle state machine.
//!
//! ```text
//! Initial -> Processing | Error
//! Processing -> Verifying | Error
//! Verifying -> Confirmed | Error
//! Confirmed -> Terminal
//! Error -> Processing | RollbackInitiated | Terminal
//! RollbackInitiated -> RollbackInProgress | Terminal
//! RollbackInProgress -> Terminal
//! ```
//!
//! `Terminal` is absorbing. The first recorded state must be `Initial`.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::store::{ObservableStore, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalOutcome {
    Success,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransactionState {
    Initial,
    Processing,
    Verifying,
    Confirmed,
    Error { reason: String },
    RollbackInitiated,
    RollbackInProgress,
    Terminal { outcome: TerminalOutcome },
}

impl TransactionState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Processing => "Processing",
            Self::Verifying => "Verifying",
            Self::Confirmed => "Confirmed",
            Self::Error { .. } => "Error",
            Self::RollbackInitiated => "RollbackInitiated",
            Self::RollbackInProgress => "RollbackInProgress",
            Self::Terminal { .. } => "Terminal",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    /// Whether the graph has an edge from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: &TransactionState) -> bool {
        use TransactionState as S;
        matches!(
            (self, next),
            (S::Initial, S::Processing | S::Error { .. })
                | (S::Processing, S::Verifying | S::Error { .. })
                | (S::Verifying, S::Confirmed | S::Error { .. })
                | (S::Confirmed, S::Terminal { .. })
                | (
                    S::Error { .. },
                    S::Processing | S::RollbackInitiated | S::Terminal { .. }
                )
                | (S::RollbackInitiated, S::RollbackInProgress | S::Terminal { .. })
                | (S::RollbackInProgress, S::Terminal { .. })
        )
    }
}

/// Current state and transition history of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub current: TransactionState,
    pub history: Vec<(TransactionState, DateTime<Utc>)>,
}

/// Validates and publishes transaction state transitions.
pub struct TransactionStateManager {
    states: ObservableStore<String, StateEntry>,
    audit: Arc<dyn AuditSink>,
}

impl TransactionStateManager {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            states: ObservableStore::new(),
            audit,
        }
    }

    /// Apply a transition, rejecting edges the graph does not allow.
    pub fn update_state(
        &self,
        transaction_id: &str,
        next: TransactionState,
    ) -> EngineResult<TransactionState> {
        let key = transaction_id.to_string();
        let result = self.states.update(|states| {
            let from = match states.get(&key) {
                None if next == TransactionState::Initial => None,
                None => return Err("None"),
                Some(entry) if entry.current.can_transition_to(&next) => {
                    Some(entry.current.name())
                }
                Some(entry) => return Err(entry.current.name()),
            };
            let now = Utc::now();
            let entry = states.entry(key.clone()).or_insert_with(|| StateEntry {
                current: next.clone(),
                history: Vec::new(),
            });
            entry.current = next.clone();
            entry.history.push((next.clone(), now));
            Ok(from)
        });

        match result {
            Ok(from) => {
                debug!(transaction_id, from = ?from, to = next.name(), "Transaction state updated");
                self.audit.log_event(
                    AuditEvent::new("TRANSACTION_STATE_UPDATED", "Transaction state updated")
                        .with("transaction_id", transaction_id)
                        .with("from", from.unwrap_or("None"))
                        .with("to", next.name()),
                );
                Ok(next)
            }
            Err(from) => {
                warn!(transaction_id, from, to = next.name(), "Rejected state transition");
                self.audit.log_event(
                    AuditEvent::new("STATE_UPDATE_FAILED", "Invalid transaction state transition")
                        .with("transaction_id", transaction_id)
                        .with("from", from)
                        .with("to", next.name()),
                );
                Err(EngineError::InvalidTransition {
                    transaction_id: transaction_id.to_string(),
                    from: from.to_string(),
                    to: next.name().to_string(),
                })
            }
        }
    }

    /// Register a transaction in `Initial` unless it is already tracked.
    pub fn track(&self, transaction_id: &str) {
        if !self.states.contains(&transaction_id.to_string()) {
            // A concurrent track may win the race; both leave it tracked.
            let _ = self.update_state(transaction_id, TransactionState::Initial);
        }
    }

    /// Move to `Error`, tracking the transaction first if needed.
    pub fn record_error(&self, transaction_id: &str, reason: &str) -> EngineResult<TransactionState> {
        self.track(transaction_id);
        self.update_state(
            transaction_id,
            TransactionState::Error {
                reason: reason.to_string(),
            },
        )
    }

    /// Walk a sequence of transitions, stopping at the first rejected one.
    pub fn advance(&self, transaction_id: &str, path: &[TransactionState]) -> EngineResult<()> {
        for next in path {
            self.update_state(transaction_id, next.clone())?;
        }
        Ok(())
    }

    pub fn current(&self, transaction_id: &str) -> Option<TransactionState> {
        self.states
            .get(&transaction_id.to_string())
            .map(|entry| entry.current)
    }

    pub fn history(&self, transaction_id: &str) -> Vec<TransactionState> {
        self.states
            .get(&transaction_id.to_string())
            .map(|entry| entry.history.into_iter().map(|(s, _)| s).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Snapshot<String, StateEntry> {
        self.states.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, StateEntry>> {
        self.states.subscribe()
    }
}
