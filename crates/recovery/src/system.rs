//! Point-in-time view of the subsystems a recovery depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ledger::{
    call_with_timeout, BlockchainState, EscrowStatus, LedgerClient, NetworkStatus,
    WalletConnectivity,
};

/// Wallet session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Connected,
    Disconnected,
    Syncing,
    Error,
}

impl WalletStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Syncing => "SYNCING",
            Self::Error => "ERROR",
        }
    }
}

/// Snapshot of network, wallet, escrow and chain health. Recomputed on
/// demand and never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub network_status: NetworkStatus,
    pub wallet_status: WalletStatus,
    pub escrow_status: EscrowStatus,
    pub blockchain_state: BlockchainState,
    pub captured_at: DateTime<Utc>,
}

impl SystemState {
    /// Everything healthy; used as the baseline in tests and simulations.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            network_status: NetworkStatus::Healthy,
            wallet_status: WalletStatus::Connected,
            escrow_status: EscrowStatus::Active,
            blockchain_state: BlockchainState::default(),
            captured_at: Utc::now(),
        }
    }

    /// Names of subsystems in their worst state (OFFLINE / ERROR / LOCKED).
    #[must_use]
    pub fn failed_subsystems(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if self.network_status == NetworkStatus::Offline {
            failed.push("network");
        }
        if self.wallet_status == WalletStatus::Error {
            failed.push("wallet");
        }
        if matches!(self.escrow_status, EscrowStatus::Error | EscrowStatus::Locked) {
            failed.push("escrow");
        }
        failed
    }

    #[must_use]
    pub fn has_failed_subsystem(&self) -> bool {
        !self.failed_subsystems().is_empty()
    }

    /// Correlation weight of the current network status in `[0, 1]`.
    #[must_use]
    pub fn network_congestion_factor(&self) -> f64 {
        match self.network_status {
            NetworkStatus::Healthy => 0.1,
            NetworkStatus::Degraded => 0.5,
            NetworkStatus::Congested => 0.8,
            NetworkStatus::Offline => 1.0,
        }
    }

    /// Chain congestion clamped to `[0, 1]`.
    #[must_use]
    pub fn blockchain_congestion_factor(&self) -> f64 {
        self.blockchain_state.congestion.clamp(0.0, 1.0)
    }

    /// Fetch a fresh snapshot. Collaborator failures degrade the affected
    /// field instead of failing the whole capture.
    pub async fn capture(
        ledger: &dyn LedgerClient,
        wallet: &dyn WalletConnectivity,
        escrow_address: Option<&str>,
        call_timeout: std::time::Duration,
    ) -> Self {
        let network_status =
            match call_with_timeout(call_timeout, "get_network_state", ledger.get_network_state())
                .await
            {
                Ok(state) => state.status,
                Err(e) => {
                    warn!(error = %e, "Network state unavailable, treating network as offline");
                    NetworkStatus::Offline
                }
            };

        let blockchain_state = match call_with_timeout(
            call_timeout,
            "get_blockchain_state",
            ledger.get_blockchain_state(),
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Blockchain state unavailable, assuming saturated chain");
                BlockchainState {
                    congestion: 1.0,
                    ..BlockchainState::default()
                }
            }
        };

        let wallet_status = if wallet.is_connected().await {
            WalletStatus::Connected
        } else {
            WalletStatus::Disconnected
        };

        let escrow_status = match escrow_address {
            None => EscrowStatus::Active,
            Some(address) => match call_with_timeout(
                call_timeout,
                "get_escrow_data",
                ledger.get_escrow_data(address),
            )
            .await
            {
                Ok(escrow) => escrow.status,
                Err(e) => {
                    warn!(escrow = address, error = %e, "Escrow state unavailable");
                    EscrowStatus::Error
                }
            },
        };

        Self {
            network_status,
            wallet_status,
            escrow_status,
            blockchain_state,
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{InMemoryLedger, StaticWallet};
    use crate::ledger::{Amount, EscrowData, LedgerError, NetworkState};
    use std::time::Duration;

    #[test]
    fn test_failed_subsystems() {
        let mut state = SystemState::healthy();
        assert!(!state.has_failed_subsystem());

        state.network_status = NetworkStatus::Offline;
        state.escrow_status = EscrowStatus::Locked;
        assert_eq!(state.failed_subsystems(), vec!["network", "escrow"]);
    }

    #[tokio::test]
    async fn test_capture_reads_collaborators() {
        let ledger = InMemoryLedger::new();
        ledger.set_network_state(NetworkState {
            status: NetworkStatus::Degraded,
            latency_ms: 900,
        });
        ledger.put_escrow(EscrowData {
            address: "GESCROW".to_string(),
            status: EscrowStatus::Pending,
            balance: Amount::from_units(10),
            required_signatures: 2,
            collected_signatures: 2,
        });
        let wallet = StaticWallet::new(false);

        let state =
            SystemState::capture(&ledger, &wallet, Some("GESCROW"), Duration::from_secs(1)).await;

        assert_eq!(state.network_status, NetworkStatus::Degraded);
        assert_eq!(state.wallet_status, WalletStatus::Disconnected);
        assert_eq!(state.escrow_status, EscrowStatus::Pending);
        assert!((state.network_congestion_factor() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_capture_degrades_on_failures() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(
            "get_network_state",
            LedgerError::Network {
                details: "unreachable".to_string(),
            },
        );
        let wallet = StaticWallet::default();

        let state =
            SystemState::capture(&ledger, &wallet, Some("GMISSING"), Duration::from_secs(1)).await;

        assert_eq!(state.network_status, NetworkStatus::Offline);
        assert_eq!(state.escrow_status, EscrowStatus::Error);
        assert_eq!(state.failed_subsystems(), vec!["network", "escrow"]);
    }
}
