//! Ledger collaborator seams and the records they exchange.
//!
//! The engine never talks to a concrete ledger. It depends on:
//! - [`LedgerClient`] for transaction lookups, compensating transfers and
//!   network health
//! - [`WalletConnectivity`] for the user's wallet session
//!
//! [`memory::InMemoryLedger`] implements both for tests and simulations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by ledger collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The call did not complete within its deadline
    #[error("Ledger call timed out: {operation}")]
    Timeout { operation: String },

    /// Transport level failure
    #[error("Ledger network error: {details}")]
    Network { details: String },

    /// Unknown transaction, account or contract
    #[error("Ledger resource not found: {id}")]
    NotFound { id: String },

    /// Ledger refused a submission
    #[error("Ledger rejected request: {reason}")]
    Rejected { reason: String },

    /// Response could not be interpreted
    #[error("Invalid ledger response: {details}")]
    InvalidResponse { details: String },
}

impl LedgerError {
    /// Timeouts and transport failures are worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout { .. } | LedgerError::Network { .. })
    }
}

/// Run a ledger call under a deadline, mapping expiry to [`LedgerError::Timeout`].
pub async fn call_with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    call: F,
) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

// =============================================================================
// Amounts
// =============================================================================

/// Number of stroops in one unit of the native asset.
const STROOPS_PER_UNIT: i64 = 10_000_000;

/// Ledger amount in stroops (1e-7 units of the native asset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero amount.
    pub const ZERO: Amount = Amount(0);

    /// Build from raw stroops.
    #[must_use]
    pub const fn from_stroops(stroops: i64) -> Self {
        Self(stroops)
    }

    /// Build from whole units.
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(STROOPS_PER_UNIT))
    }

    /// Raw stroop value.
    #[must_use]
    pub const fn stroops(self) -> i64 {
        self.0
    }

    /// Strictly positive.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Multiply by `numerator / denominator`, rounding toward zero.
    #[must_use]
    pub fn scaled(self, numerator: i64, denominator: i64) -> Self {
        if denominator == 0 {
            return Self::ZERO;
        }
        let value = i128::from(self.0) * i128::from(numerator) / i128::from(denominator);
        Self(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let units = abs / STROOPS_PER_UNIT.unsigned_abs();
        let frac = abs % STROOPS_PER_UNIT.unsigned_abs();
        if frac == 0 {
            write!(f, "{sign}{units}")
        } else {
            let digits = format!("{frac:07}");
            write!(f, "{sign}{units}.{}", digits.trim_end_matches('0'))
        }
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::InvalidResponse {
            details: format!("invalid amount '{s}'"),
        };
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.len() > 7 {
            return Err(invalid());
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac: i64 = if frac.is_empty() {
            0
        } else {
            format!("{frac:0<7}").parse().map_err(|_| invalid())?
        };
        let stroops = whole
            .checked_mul(STROOPS_PER_UNIT)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -stroops } else { stroops }))
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Settlement status reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Submitted but not yet closed in a ledger
    Pending,
    /// Applied successfully
    Success,
    /// Closed with a failure result
    Failed,
}

/// Operation type inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Payment,
    InvokeContract,
    ManageEscrow,
    Other,
}

/// One operation of a ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation type
    pub kind: OperationKind,

    /// Operation source account, when it differs from the transaction source
    #[serde(default)]
    pub source_account: Option<String>,

    /// Invoked contract (for `invoke_contract`)
    #[serde(default)]
    pub contract_address: Option<String>,

    /// Invoked function name (for `invoke_contract`)
    #[serde(default)]
    pub function_name: Option<String>,

    /// Escrow account touched (for `manage_escrow`)
    #[serde(default)]
    pub escrow_address: Option<String>,
}

impl Operation {
    /// Plain payment operation.
    #[must_use]
    pub fn payment() -> Self {
        Self {
            kind: OperationKind::Payment,
            source_account: None,
            contract_address: None,
            function_name: None,
            escrow_address: None,
        }
    }

    /// Contract invocation.
    #[must_use]
    pub fn invoke_contract(contract_address: &str, function_name: &str) -> Self {
        Self {
            kind: OperationKind::InvokeContract,
            contract_address: Some(contract_address.to_string()),
            function_name: Some(function_name.to_string()),
            ..Self::payment()
        }
    }

    /// Escrow management operation.
    #[must_use]
    pub fn manage_escrow(escrow_address: &str) -> Self {
        Self {
            kind: OperationKind::ManageEscrow,
            escrow_address: Some(escrow_address.to_string()),
            ..Self::payment()
        }
    }
}

/// Account balance line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// `native` or an asset code
    pub asset_type: String,
    /// Balance amount
    pub balance: Amount,
}

/// Raw ledger view of a transaction, as returned by [`LedgerClient::get_transaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Ledger transaction id (hash)
    pub id: String,

    /// Paying account
    pub source_account: String,

    /// Receiving account
    pub destination_account: String,

    /// Transferred amount
    pub amount: Amount,

    /// Fee charged by the ledger
    #[serde(default)]
    pub fee_charged: Amount,

    /// Settlement status
    pub status: TransactionStatus,

    /// Result code string (e.g. `tx_success`, `tx_failed,op_underfunded`)
    #[serde(default)]
    pub result_code: String,

    /// Submission time
    pub created_at: DateTime<Utc>,

    /// Ledger close time, absent while pending
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,

    /// Operations in submission order
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Source account balances at query time
    #[serde(default)]
    pub balances: Vec<Balance>,

    /// Sequence number used by the transaction
    #[serde(default)]
    pub sequence: Option<i64>,

    /// Current sequence number of the source account
    #[serde(default)]
    pub account_sequence: Option<i64>,

    /// Transaction memo
    #[serde(default)]
    pub memo: Option<String>,
}

impl LedgerTransaction {
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status == TransactionStatus::Success
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == TransactionStatus::Failed
    }

    /// Time between submission and close, if closed.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        let closed = self.closed_at?;
        (closed - self.created_at).to_std().ok()
    }

    /// Whether the result code contains a marker (case-insensitive).
    #[must_use]
    pub fn has_marker(&self, marker: &str) -> bool {
        self.result_code.to_ascii_lowercase().contains(marker)
    }

    /// First contract invocation, if any.
    #[must_use]
    pub fn contract_invocation(&self) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.kind == OperationKind::InvokeContract)
    }

    /// First escrow operation, if any.
    #[must_use]
    pub fn escrow_operation(&self) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.kind == OperationKind::ManageEscrow)
    }

    #[must_use]
    pub fn contract_address(&self) -> Option<&str> {
        self.contract_invocation()?.contract_address.as_deref()
    }

    #[must_use]
    pub fn escrow_address(&self) -> Option<&str> {
        self.escrow_operation()?.escrow_address.as_deref()
    }

    /// Native balance of the source account (zero if absent).
    #[must_use]
    pub fn native_balance(&self) -> Amount {
        self.balances
            .iter()
            .find(|b| b.asset_type == "native")
            .map_or(Amount::ZERO, |b| b.balance)
    }

    /// Accounts and amount are present.
    #[must_use]
    pub fn has_complete_details(&self) -> bool {
        !self.source_account.trim().is_empty()
            && !self.destination_account.trim().is_empty()
            && self.amount.is_positive()
    }

    /// Internal consistency of the record: close time and status agree and
    /// the result code does not contradict the status.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let close_ok = match (self.status, self.closed_at) {
            (TransactionStatus::Pending, None) => true,
            (TransactionStatus::Pending, Some(_)) => false,
            (_, Some(closed)) => closed >= self.created_at,
            (_, None) => false,
        };
        let code_ok = match self.status {
            TransactionStatus::Success => {
                self.result_code.is_empty() || self.has_marker("tx_success")
            }
            TransactionStatus::Failed => !self.has_marker("tx_success"),
            TransactionStatus::Pending => true,
        };
        close_ok && code_ok && self.source_account != self.destination_account
    }
}

// =============================================================================
// Network and escrow state
// =============================================================================

/// Chain-level health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainState {
    /// Latest closed ledger height
    pub height: u64,
    /// Average ledger close time in milliseconds
    pub avg_block_time_ms: u64,
    /// Congestion ratio in `[0, 1]`
    pub congestion: f64,
    /// Current base fee in stroops
    pub gas_price: u64,
}

impl BlockchainState {
    const HEALTHY_CONGESTION_CEILING: f64 = 0.8;
    const HEALTHY_BLOCK_TIME_MS: u64 = 10_000;

    /// Congestion below 80% and ledgers closing within 10 seconds.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.congestion < Self::HEALTHY_CONGESTION_CEILING
            && self.avg_block_time_ms <= Self::HEALTHY_BLOCK_TIME_MS
    }
}

impl Default for BlockchainState {
    fn default() -> Self {
        Self {
            height: 0,
            avg_block_time_ms: 5_000,
            congestion: 0.1,
            gas_price: 100,
        }
    }
}

/// Network connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkStatus {
    Healthy,
    Congested,
    Degraded,
    Offline,
}

impl NetworkStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Congested => "CONGESTED",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
        }
    }
}

/// Network-level health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Overall status
    pub status: NetworkStatus,
    /// Round-trip latency to the ledger API in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            status: NetworkStatus::Healthy,
            latency_ms: 50,
        }
    }
}

/// Escrow account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Active,
    Locked,
    Pending,
    Released,
    Error,
}

impl EscrowStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Locked => "LOCKED",
            Self::Pending => "PENDING",
            Self::Released => "RELEASED",
            Self::Error => "ERROR",
        }
    }
}

/// Escrow account details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowData {
    /// Escrow account address
    pub address: String,
    /// Escrow status
    pub status: EscrowStatus,
    /// Funds held
    pub balance: Amount,
    /// Signatures required to release
    #[serde(default)]
    pub required_signatures: u32,
    /// Signatures collected so far
    #[serde(default)]
    pub collected_signatures: u32,
}

impl EscrowData {
    #[must_use]
    pub fn missing_signatures(&self) -> u32 {
        self.required_signatures
            .saturating_sub(self.collected_signatures)
    }

    /// Active and fully signed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == EscrowStatus::Active && self.missing_signatures() == 0
    }
}

/// Contract state as reported by the ledger oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleData {
    /// Contract address
    pub contract_address: String,
    /// Whether the contract's stored state passes its own invariants
    pub state_valid: bool,
    /// When the oracle last observed the contract
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

/// Status of an atomic swap bound to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicSwapStatus {
    NotApplicable,
    Pending,
    Completed,
    Failed,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Access to the external ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Look up a transaction by id.
    async fn get_transaction(&self, transaction_id: &str) -> Result<LedgerTransaction, LedgerError>;

    /// Submit a payment; returns the new transaction id.
    async fn submit_transaction(
        &self,
        source: &str,
        destination: &str,
        amount: Amount,
        memo: &str,
    ) -> Result<String, LedgerError>;

    /// Release escrowed funds to a beneficiary; returns the release transaction id.
    async fn release_escrow(
        &self,
        escrow_account: &str,
        beneficiary: &str,
        amount: Amount,
    ) -> Result<String, LedgerError>;

    /// Invoke a contract's reversal entry point; returns the reversal transaction id.
    async fn reverse_contract(
        &self,
        contract_address: &str,
        transaction_id: &str,
    ) -> Result<String, LedgerError>;

    async fn get_blockchain_state(&self) -> Result<BlockchainState, LedgerError>;

    async fn get_network_state(&self) -> Result<NetworkState, LedgerError>;

    async fn get_escrow_data(&self, escrow_address: &str) -> Result<EscrowData, LedgerError>;

    async fn get_oracle_data(&self, contract_address: &str) -> Result<OracleData, LedgerError>;

    async fn get_atomic_swap_status(
        &self,
        transaction_id: &str,
    ) -> Result<AtomicSwapStatus, LedgerError>;
}

/// The user's wallet session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletConnectivity: Send + Sync {
    async fn is_connected(&self) -> bool;
}
