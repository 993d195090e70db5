//! Transaction recovery engine for escrow payments settled on a public ledger.
//!
//! The engine watches in-flight transactions, classifies failures into a
//! closed taxonomy, assesses risk against live system state and recent error
//! patterns, and then recovers automatically (wait, retry, roll back) or
//! hands the case to an admin through a role-gated intervention ticket.
//!
//! # Architecture
//!
//! - [`ledger`]: `LedgerClient` / `WalletConnectivity` seams and an in-memory ledger
//! - [`classifier`]: raw transaction result to [`taxonomy::TransactionError`]
//! - [`forensics`] and [`patterns`]: risk assessment and anomaly feedback
//! - [`orchestrator`]: per-error recovery runs and strategy dispatch
//! - [`monitor`]: one cancellable polling task per transaction
//! - [`verification`]: staged post-recovery consistency checks
//! - [`rollback`]: compensating refunds, escrow releases and contract reversals
//! - [`access`]: roles, sessions and manual intervention tickets
//! - [`context`]: [`RecoveryContext`] wiring all of the above
//!
//! Every shared collection is an [`store::ObservableStore`]: mutations replace
//! the whole map and are published to `watch` subscribers.
//!
//! # Configuration
//!
//! See [`config::RecoveryConfig`]; most fields can be overridden through a
//! `RECOVERY_*` environment variable.

pub mod access;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod forensics;
pub mod ledger;
pub mod monitor;
pub mod orchestrator;
pub mod patterns;
pub mod rollback;
pub mod state;
pub mod store;
pub mod system;
pub mod taxonomy;
pub mod verification;

pub use config::RecoveryConfig;
pub use context::RecoveryContext;
pub use error::{EngineError, EngineResult};
pub use ledger::LedgerError;
pub use orchestrator::{RecoveryResult, RecoveryStatus};
pub use taxonomy::{ErrorKind, Severity, TransactionError};
