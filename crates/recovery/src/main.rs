//! Recovery operator CLI
//!
//! Runs the recovery engine against a JSON ledger fixture: classify a single
//! transaction, run the verification pipeline, or simulate full monitoring
//! and recovery of every fixture transaction.

use anyhow::{Context, Result};
use audit::{AuditLog, AuditSink};
use clap::{Parser, Subcommand};
use escrow_recovery::access::InterventionTicket;
use escrow_recovery::classifier::classify_transaction;
use escrow_recovery::ledger::memory::{InMemoryLedger, LedgerFixture, StaticWallet, SubmittedTransfer};
use escrow_recovery::monitor::MonitorStatus;
use escrow_recovery::orchestrator::RecoveryRun;
use escrow_recovery::state::TransactionState;
use escrow_recovery::{RecoveryConfig, RecoveryContext};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Transaction recovery engine for escrow payments
#[derive(Parser)]
#[command(name = "recovery")]
#[command(about = "Classify, verify and recover escrow ledger transactions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Engine configuration file (JSON); RECOVERY_* variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one fixture transaction
    Classify {
        /// Ledger fixture (JSON)
        #[arg(long)]
        fixture: PathBuf,

        /// Transaction id
        #[arg(long)]
        tx: String,
    },

    /// Run the verification pipeline for one transaction
    Verify {
        /// Ledger fixture (JSON)
        #[arg(long)]
        fixture: PathBuf,

        /// Transaction id
        #[arg(long)]
        tx: String,

        /// Run stages in concurrent batches
        #[arg(long)]
        batched: bool,
    },

    /// Monitor every fixture transaction through the full engine
    Simulate {
        /// Ledger fixture (JSON)
        #[arg(long)]
        fixture: PathBuf,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Print the effective retry schedule
    Backoff,

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Serialize)]
struct TransactionOutcome {
    transaction_id: String,
    monitor: Option<MonitorStatus>,
    recovery: Option<RecoveryRun>,
    state: Option<TransactionState>,
}

#[derive(Serialize)]
struct SimulationReport {
    transactions: Vec<TransactionOutcome>,
    tickets: Vec<InterventionTicket>,
    compensations: Vec<SubmittedTransfer>,
    timed_out: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Classify { fixture, tx } => classify(&config, &fixture, &tx)?,
        Commands::Verify {
            fixture,
            tx,
            batched,
        } => verify(config, &fixture, &tx, batched).await?,
        Commands::Simulate {
            fixture,
            timeout_secs,
        } => simulate(config, &fixture, Duration::from_secs(timeout_secs)).await?,
        Commands::Backoff => print_backoff(&config),
        Commands::Config => print_json(&config)?,
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<RecoveryConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: RecoveryConfig = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.overlay_env()
        }
        None => RecoveryConfig::from_env(),
    };
    config.validate().context("Invalid recovery configuration")?;
    Ok(config)
}

fn load_fixture(path: &Path) -> Result<LedgerFixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse fixture {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}

/// Build an engine around the fixture's in-memory ledger.
fn build_context(
    config: RecoveryConfig,
    fixture: &LedgerFixture,
) -> Result<(RecoveryContext, Arc<InMemoryLedger>)> {
    let ledger = Arc::new(InMemoryLedger::from_fixture(fixture));
    let wallet = Arc::new(StaticWallet::new(fixture.wallet_connected.unwrap_or(true)));
    let audit: Arc<dyn AuditSink> = Arc::new(AuditLog::from_env());
    let context = RecoveryContext::new(config, ledger.clone(), wallet, audit)
        .context("Failed to initialize recovery engine")?;
    Ok((context, ledger))
}

fn classify(config: &RecoveryConfig, fixture_path: &Path, transaction_id: &str) -> Result<()> {
    let fixture = load_fixture(fixture_path)?;
    let tx = fixture
        .transactions
        .iter()
        .find(|tx| tx.id == transaction_id)
        .with_context(|| format!("Transaction {transaction_id} not found in fixture"))?;

    let error = classify_transaction(
        tx,
        fixture.wallet_connected.unwrap_or(true),
        config.congestion_latency_threshold,
    );
    match &error {
        Some(error) => info!(transaction_id, error_type = error.kind_name(), "Transaction classified"),
        None => info!(transaction_id, "No error detected"),
    }
    print_json(&error)
}

async fn verify(
    config: RecoveryConfig,
    fixture_path: &Path,
    transaction_id: &str,
    batched: bool,
) -> Result<()> {
    let fixture = load_fixture(fixture_path)?;
    let (context, _) = build_context(config, &fixture)?;

    let state = if batched {
        context.start_verification_batched(transaction_id).await
    } else {
        context.start_verification(transaction_id).await
    };
    print_json(&state)
}

async fn simulate(config: RecoveryConfig, fixture_path: &Path, timeout: Duration) -> Result<()> {
    let fixture = load_fixture(fixture_path)?;
    let (context, ledger) = build_context(config, &fixture)?;
    let transaction_ids: Vec<String> = fixture.transactions.iter().map(|tx| tx.id.clone()).collect();

    info!(count = transaction_ids.len(), "Starting simulation");
    for transaction_id in &transaction_ids {
        context.start_monitoring(transaction_id);
    }

    let waits = transaction_ids.iter().map(|transaction_id| {
        let context = &context;
        async move {
            let monitor = context.monitor().wait_until_settled(transaction_id).await;
            let error_id = match &monitor {
                Some(
                    MonitorStatus::ErrorReported { error_id, .. }
                    | MonitorStatus::MaxRetriesReached { error_id },
                ) => Some(error_id.clone()),
                _ => None,
            };
            let recovery = match error_id {
                Some(error_id) => context.orchestrator().wait_for_outcome(&error_id).await,
                None => None,
            };
            (transaction_id.clone(), monitor, recovery)
        }
    });

    let settled = tokio::time::timeout(timeout, futures::future::join_all(waits)).await;
    let timed_out = settled.is_err();
    if timed_out {
        warn!(timeout_secs = timeout.as_secs(), "Simulation timed out; reporting current state");
    }

    let transactions = match settled {
        Ok(outcomes) => outcomes
            .into_iter()
            .map(|(transaction_id, monitor, recovery)| TransactionOutcome {
                state: context.states().current(&transaction_id),
                transaction_id,
                monitor,
                recovery,
            })
            .collect(),
        Err(_) => {
            let runs = context.orchestrator().runs();
            transaction_ids
                .into_iter()
                .map(|transaction_id| TransactionOutcome {
                    monitor: context.monitor().status(&transaction_id),
                    recovery: runs
                        .values()
                        .filter(|run| run.error.transaction_id == transaction_id)
                        .max_by_key(|run| run.started_at)
                        .cloned(),
                    state: context.states().current(&transaction_id),
                    transaction_id,
                })
                .collect()
        }
    };

    let mut tickets: Vec<InterventionTicket> =
        context.interventions().tickets().values().cloned().collect();
    tickets.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

    print_json(&SimulationReport {
        transactions,
        tickets,
        compensations: ledger.submitted(),
        timed_out,
    })
}

fn print_backoff(config: &RecoveryConfig) {
    let retry = &config.retry;
    println!(
        "max_attempts={} initial={}ms max={}ms multiplier={}",
        retry.max_attempts,
        retry.initial_delay.as_millis(),
        retry.max_delay.as_millis(),
        retry.backoff_multiplier
    );
    for attempt in 1..=retry.max_attempts {
        if retry.should_retry(attempt) {
            println!(
                "attempt {attempt}: wait {}ms, then retry",
                retry.delay_for_attempt(attempt).as_millis()
            );
        } else {
            println!("attempt {attempt}: give up");
        }
    }
}
