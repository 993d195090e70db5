//! Scriptable in-memory ledger and wallet.
//!
//! Used by the integration tests and by the `simulate` CLI command. Every
//! call is counted per method; failures and latency can be injected per
//! method, and a transaction can be given a sequence of states that
//! successive `get_transaction` calls walk through.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{
    Amount, AtomicSwapStatus, BlockchainState, EscrowData, LedgerClient, LedgerError,
    LedgerTransaction, NetworkState, OracleData, WalletConnectivity,
};

/// Declarative starting state for an [`InMemoryLedger`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerFixture {
    /// Known transactions
    pub transactions: Vec<LedgerTransaction>,
    /// Chain health
    pub blockchain: BlockchainState,
    /// Network health
    pub network: NetworkState,
    /// Escrow accounts
    pub escrows: Vec<EscrowData>,
    /// Contract oracle entries
    pub oracles: Vec<OracleData>,
    /// Atomic swap status by transaction id
    pub swaps: HashMap<String, AtomicSwapStatus>,
    /// Whether the wallet starts connected
    pub wallet_connected: Option<bool>,
}

/// A compensating transfer recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedTransfer {
    /// Resulting transaction id
    pub transaction_id: String,
    /// `payment`, `escrow_release` or `contract_reversal`
    pub kind: &'static str,
    /// Paying account, escrow account or contract
    pub from: String,
    /// Beneficiary or reversed transaction
    pub to: String,
    /// Amount moved (zero for contract reversals)
    pub amount: Amount,
    /// Memo attached to payments
    pub memo: Option<String>,
}

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<String, VecDeque<LedgerTransaction>>,
    blockchain: BlockchainState,
    network: NetworkState,
    escrows: HashMap<String, EscrowData>,
    oracles: HashMap<String, OracleData>,
    swaps: HashMap<String, AtomicSwapStatus>,
    submitted: Vec<SubmittedTransfer>,
    failures: HashMap<&'static str, VecDeque<LedgerError>>,
    latency: HashMap<&'static str, Duration>,
    calls: HashMap<&'static str, usize>,
    hash_override: Option<String>,
    next_hash: u64,
}

/// In-memory [`LedgerClient`].
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a fixture.
    #[must_use]
    pub fn from_fixture(fixture: &LedgerFixture) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state.lock();
            for tx in &fixture.transactions {
                state
                    .transactions
                    .insert(tx.id.clone(), VecDeque::from([tx.clone()]));
            }
            state.blockchain = fixture.blockchain.clone();
            state.network = fixture.network.clone();
            state.escrows = fixture
                .escrows
                .iter()
                .map(|e| (e.address.clone(), e.clone()))
                .collect();
            state.oracles = fixture
                .oracles
                .iter()
                .map(|o| (o.contract_address.clone(), o.clone()))
                .collect();
            state.swaps = fixture.swaps.clone();
        }
        ledger
    }

    /// Insert or replace a transaction.
    pub fn put_transaction(&self, tx: LedgerTransaction) {
        self.state
            .lock()
            .transactions
            .insert(tx.id.clone(), VecDeque::from([tx]));
    }

    /// Successive `get_transaction` calls return these states in order; the
    /// last one repeats.
    pub fn script_transaction(&self, id: &str, states: Vec<LedgerTransaction>) {
        if states.is_empty() {
            return;
        }
        self.state
            .lock()
            .transactions
            .insert(id.to_string(), states.into());
    }

    pub fn set_blockchain_state(&self, blockchain: BlockchainState) {
        self.state.lock().blockchain = blockchain;
    }

    pub fn set_network_state(&self, network: NetworkState) {
        self.state.lock().network = network;
    }

    pub fn put_escrow(&self, escrow: EscrowData) {
        self.state
            .lock()
            .escrows
            .insert(escrow.address.clone(), escrow);
    }

    pub fn put_oracle(&self, oracle: OracleData) {
        self.state
            .lock()
            .oracles
            .insert(oracle.contract_address.clone(), oracle);
    }

    pub fn set_swap_status(&self, transaction_id: &str, status: AtomicSwapStatus) {
        self.state
            .lock()
            .swaps
            .insert(transaction_id.to_string(), status);
    }

    /// The next call to `method` fails with `error`.
    pub fn fail_next(&self, method: &'static str, error: LedgerError) {
        self.state
            .lock()
            .failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Every call to `method` sleeps for `delay` before answering.
    pub fn set_latency(&self, method: &'static str, delay: Duration) {
        self.state.lock().latency.insert(method, delay);
    }

    /// Force the id returned by submissions (e.g. an empty id).
    pub fn override_transaction_hash(&self, hash: Option<String>) {
        self.state.lock().hash_override = hash;
    }

    /// Number of calls made to `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// All compensating transfers submitted so far.
    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.state.lock().submitted.clone()
    }

    /// Ids of all known transactions.
    pub fn transaction_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().transactions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Count the call, apply injected latency, and pop an injected failure.
    async fn enter(&self, method: &'static str) -> Result<(), LedgerError> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(method).or_default() += 1;
            let failure = state
                .failures
                .get_mut(method)
                .and_then(VecDeque::pop_front);
            (state.latency.get(method).copied(), failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }

    fn record_transfer(
        &self,
        kind: &'static str,
        from: &str,
        to: &str,
        amount: Amount,
        memo: Option<&str>,
    ) -> String {
        let mut state = self.state.lock();
        state.next_hash += 1;
        let transaction_id = state
            .hash_override
            .clone()
            .unwrap_or_else(|| format!("sim-{:016x}", state.next_hash));
        state.submitted.push(SubmittedTransfer {
            transaction_id: transaction_id.clone(),
            kind,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            memo: memo.map(str::to_string),
        });
        transaction_id
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_transaction(&self, transaction_id: &str) -> Result<LedgerTransaction, LedgerError> {
        self.enter("get_transaction").await?;
        let mut state = self.state.lock();
        let states = state
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| LedgerError::NotFound {
                id: transaction_id.to_string(),
            })?;
        let current = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        current.ok_or_else(|| LedgerError::NotFound {
            id: transaction_id.to_string(),
        })
    }

    async fn submit_transaction(
        &self,
        source: &str,
        destination: &str,
        amount: Amount,
        memo: &str,
    ) -> Result<String, LedgerError> {
        self.enter("submit_transaction").await?;
        Ok(self.record_transfer("payment", source, destination, amount, Some(memo)))
    }

    async fn release_escrow(
        &self,
        escrow_account: &str,
        beneficiary: &str,
        amount: Amount,
    ) -> Result<String, LedgerError> {
        self.enter("release_escrow").await?;
        Ok(self.record_transfer("escrow_release", escrow_account, beneficiary, amount, None))
    }

    async fn reverse_contract(
        &self,
        contract_address: &str,
        transaction_id: &str,
    ) -> Result<String, LedgerError> {
        self.enter("reverse_contract").await?;
        Ok(self.record_transfer(
            "contract_reversal",
            contract_address,
            transaction_id,
            Amount::ZERO,
            None,
        ))
    }

    async fn get_blockchain_state(&self) -> Result<BlockchainState, LedgerError> {
        self.enter("get_blockchain_state").await?;
        Ok(self.state.lock().blockchain.clone())
    }

    async fn get_network_state(&self) -> Result<NetworkState, LedgerError> {
        self.enter("get_network_state").await?;
        Ok(self.state.lock().network.clone())
    }

    async fn get_escrow_data(&self, escrow_address: &str) -> Result<EscrowData, LedgerError> {
        self.enter("get_escrow_data").await?;
        self.state
            .lock()
            .escrows
            .get(escrow_address)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound {
                id: escrow_address.to_string(),
            })
    }

    async fn get_oracle_data(&self, contract_address: &str) -> Result<OracleData, LedgerError> {
        self.enter("get_oracle_data").await?;
        self.state
            .lock()
            .oracles
            .get(contract_address)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound {
                id: contract_address.to_string(),
            })
    }

    async fn get_atomic_swap_status(
        &self,
        transaction_id: &str,
    ) -> Result<AtomicSwapStatus, LedgerError> {
        self.enter("get_atomic_swap_status").await?;
        Ok(self
            .state
            .lock()
            .swaps
            .get(transaction_id)
            .copied()
            .unwrap_or(AtomicSwapStatus::NotApplicable))
    }
}

/// Wallet whose connectivity is toggled by the test or simulation.
#[derive(Debug)]
pub struct StaticWallet {
    connected: AtomicBool,
}

impl StaticWallet {
    #[must_use]
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for StaticWallet {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl WalletConnectivity for StaticWallet {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Operation, TransactionStatus};
    use chrono::Utc;

    fn pending(id: &str) -> LedgerTransaction {
        LedgerTransaction {
            id: id.to_string(),
            source_account: "GSRC".to_string(),
            destination_account: "GDST".to_string(),
            amount: Amount::from_units(5),
            fee_charged: Amount::from_stroops(100),
            status: TransactionStatus::Pending,
            result_code: String::new(),
            created_at: Utc::now(),
            closed_at: None,
            operations: vec![Operation::payment()],
            balances: vec![],
            sequence: None,
            account_sequence: None,
            memo: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_states_walk_then_repeat() {
        let ledger = InMemoryLedger::new();
        let mut done = pending("tx-1");
        done.status = TransactionStatus::Success;
        ledger.script_transaction("tx-1", vec![pending("tx-1"), done]);

        assert!(ledger.get_transaction("tx-1").await.unwrap().is_pending());
        assert!(ledger.get_transaction("tx-1").await.unwrap().is_successful());
        assert!(ledger.get_transaction("tx-1").await.unwrap().is_successful());
        assert_eq!(ledger.call_count("get_transaction"), 3);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let ledger = InMemoryLedger::new();
        ledger.put_transaction(pending("tx-2"));
        ledger.fail_next(
            "get_transaction",
            LedgerError::Network {
                details: "reset".to_string(),
            },
        );

        assert!(ledger.get_transaction("tx-2").await.is_err());
        assert!(ledger.get_transaction("tx-2").await.is_ok());
        assert!(matches!(
            ledger.get_transaction("missing").await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transfers_are_recorded() {
        let ledger = InMemoryLedger::new();
        let id = ledger
            .submit_transaction("GDST", "GSRC", Amount::from_units(5), "refund")
            .await
            .unwrap();
        assert!(id.starts_with("sim-"));

        let submitted = ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].kind, "payment");
        assert_eq!(submitted[0].memo.as_deref(), Some("refund"));
    }

    #[tokio::test]
    async fn test_wallet_toggle() {
        let wallet = StaticWallet::default();
        assert!(wallet.is_connected().await);
        wallet.set_connected(false);
        assert!(!wallet.is_connected().await);
    }
}
