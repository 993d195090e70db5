//! Engine wiring.
//!
//! [`RecoveryContext`] owns one instance of every component and the shared
//! collaborators (ledger, wallet, audit sink). It is the public entry point
//! for embedding the engine.

use audit::AuditSink;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::access::{
    AccessControl, AdminRole, InterventionDesk, InterventionPriority, InterventionResult,
    InterventionTicket, RecoveryOperation,
};
use crate::classifier::ErrorClassifier;
use crate::config::RecoveryConfig;
use crate::error::{EngineError, EngineResult};
use crate::forensics::{ForensicsAnalyzer, ForensicsReport};
use crate::ledger::{LedgerClient, WalletConnectivity};
use crate::monitor::{MonitorDeps, TransactionMonitor};
use crate::orchestrator::{OrchestratorDeps, RecoveryOrchestrator, RecoveryResult, RecoveryRun};
use crate::patterns::PatternTracker;
use crate::rollback::{RollbackEngine, RollbackState};
use crate::state::TransactionStateManager;
use crate::store::Snapshot;
use crate::taxonomy::TransactionError;
use crate::verification::{VerificationPipeline, VerificationRun, VerificationState};

pub struct RecoveryContext {
    config: RecoveryConfig,
    audit: Arc<dyn AuditSink>,
    classifier: Arc<ErrorClassifier>,
    patterns: Arc<PatternTracker>,
    forensics: Arc<ForensicsAnalyzer>,
    verification: Arc<VerificationPipeline>,
    rollback: Arc<RollbackEngine>,
    states: Arc<TransactionStateManager>,
    access: Arc<AccessControl>,
    interventions: Arc<InterventionDesk>,
    orchestrator: Arc<RecoveryOrchestrator>,
    monitor: Arc<TransactionMonitor>,
}

impl RecoveryContext {
    /// Validate `config` and build every component around the given
    /// collaborators.
    pub fn new(
        config: RecoveryConfig,
        ledger: Arc<dyn LedgerClient>,
        wallet: Arc<dyn WalletConnectivity>,
        audit: Arc<dyn AuditSink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let timeout = config.ledger_call_timeout;

        let classifier = Arc::new(ErrorClassifier::new(
            ledger.clone(),
            wallet.clone(),
            audit.clone(),
            config.congestion_latency_threshold,
            timeout,
        ));
        let patterns = Arc::new(PatternTracker::new(config.pattern_window, audit.clone()));
        let forensics = Arc::new(ForensicsAnalyzer::new(
            ledger.clone(),
            wallet.clone(),
            classifier.clone(),
            patterns.clone(),
            audit.clone(),
            timeout,
        ));
        let verification = Arc::new(VerificationPipeline::new(
            ledger.clone(),
            wallet.clone(),
            audit.clone(),
            config.verification.clone(),
            timeout,
        ));
        let rollback = Arc::new(RollbackEngine::new(
            ledger.clone(),
            wallet.clone(),
            audit.clone(),
            timeout,
        ));
        let states = Arc::new(TransactionStateManager::new(audit.clone()));
        let access = Arc::new(AccessControl::new(config.session_timeout, audit.clone()));
        let interventions = Arc::new(InterventionDesk::new(
            access.directory().clone(),
            access.sessions().clone(),
            access.permission_table().clone(),
            audit.clone(),
        ));
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            OrchestratorDeps {
                ledger: ledger.clone(),
                wallet: wallet.clone(),
                patterns: patterns.clone(),
                forensics: forensics.clone(),
                rollback: rollback.clone(),
                interventions: interventions.clone(),
                states: states.clone(),
                audit: audit.clone(),
            },
            &config,
        ));
        let monitor = Arc::new(TransactionMonitor::new(
            MonitorDeps {
                ledger,
                wallet,
                classifier: classifier.clone(),
                orchestrator: orchestrator.clone(),
                states: states.clone(),
                audit: audit.clone(),
            },
            &config,
        ));

        info!(
            poll_interval_ms = config.monitor.poll_interval.as_millis(),
            max_attempts = config.retry.max_attempts,
            "Recovery engine initialized"
        );

        Ok(Self {
            config,
            audit,
            classifier,
            patterns,
            forensics,
            verification,
            rollback,
            states,
            access,
            interventions,
            orchestrator,
            monitor,
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn patterns(&self) -> &Arc<PatternTracker> {
        &self.patterns
    }

    pub fn forensics(&self) -> &Arc<ForensicsAnalyzer> {
        &self.forensics
    }

    pub fn verification(&self) -> &Arc<VerificationPipeline> {
        &self.verification
    }

    pub fn rollback(&self) -> &Arc<RollbackEngine> {
        &self.rollback
    }

    pub fn states(&self) -> &Arc<TransactionStateManager> {
        &self.states
    }

    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    pub fn interventions(&self) -> &Arc<InterventionDesk> {
        &self.interventions
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub fn report_error(&self, error: TransactionError) -> String {
        self.orchestrator.report_error(error)
    }

    pub fn get_recovery_status(&self, error_id: &str) -> RecoveryResult {
        self.orchestrator.get_recovery_status(error_id)
    }

    pub fn get_active_recoveries(&self) -> Vec<TransactionError> {
        self.orchestrator.get_active_recoveries()
    }

    pub fn subscribe_recoveries(&self) -> watch::Receiver<Snapshot<String, RecoveryRun>> {
        self.orchestrator.subscribe()
    }

    pub fn cancel_recovery(&self, error_id: &str) -> EngineResult<bool> {
        self.orchestrator.cancel_recovery(error_id)
    }

    pub async fn analyze(&self, transaction_id: &str) -> EngineResult<ForensicsReport> {
        self.forensics.analyze(transaction_id).await
    }

    /// Admin-initiated recovery.
    pub fn initiate_recovery(
        &self,
        admin_id: &str,
        token: &str,
        error: TransactionError,
    ) -> EngineResult<String> {
        self.access
            .verify_access(admin_id, token, RecoveryOperation::InitiateRecovery)?;
        Ok(self.orchestrator.report_error(error))
    }

    /// Admin-initiated cancellation.
    pub fn cancel_recovery_as(&self, admin_id: &str, token: &str, error_id: &str) -> EngineResult<bool> {
        self.access
            .verify_access(admin_id, token, RecoveryOperation::CancelRecovery)?;
        self.orchestrator.cancel_recovery(error_id)
    }

    /// Admin-initiated rollback of the transaction's latest classified error.
    pub async fn rollback_transaction(
        &self,
        admin_id: &str,
        token: &str,
        transaction_id: &str,
    ) -> EngineResult<RollbackState> {
        self.access
            .verify_access(admin_id, token, RecoveryOperation::RollbackTransaction)?;
        let error = self
            .classifier
            .current_error(transaction_id)
            .ok_or_else(|| EngineError::ErrorNotFound {
                transaction_id: transaction_id.to_string(),
            })?;
        self.rollback.initiate_rollback(transaction_id, &error).await
    }

    // =========================================================================
    // Manual intervention
    // =========================================================================

    pub fn request_manual_intervention(
        &self,
        error: &TransactionError,
        reason: &str,
    ) -> InterventionTicket {
        self.orchestrator.request_manual_intervention(error, reason)
    }

    /// Open a ticket with an explicit role and priority.
    pub fn create_intervention_request(
        &self,
        error: &TransactionError,
        reason: &str,
        required_role: AdminRole,
        priority: InterventionPriority,
    ) -> InterventionTicket {
        self.interventions
            .create_intervention_request(error, &error.id, reason, required_role, priority)
    }

    pub fn approve_intervention(
        &self,
        ticket_id: &str,
        admin_id: &str,
        notes: &str,
    ) -> EngineResult<InterventionResult> {
        self.interventions
            .approve_intervention(ticket_id, admin_id, notes)
    }

    pub fn reject_intervention(
        &self,
        ticket_id: &str,
        admin_id: &str,
        reason: &str,
    ) -> EngineResult<InterventionResult> {
        self.interventions
            .reject_intervention(ticket_id, admin_id, reason)
    }

    pub fn list_intervention_requests(&self, admin_id: &str) -> Vec<InterventionTicket> {
        self.interventions.list_intervention_requests(admin_id)
    }

    // =========================================================================
    // Monitoring and verification
    // =========================================================================

    pub fn start_monitoring(&self, transaction_id: &str) -> bool {
        self.monitor.start_monitoring(transaction_id)
    }

    pub fn stop_monitoring(&self, transaction_id: &str) -> bool {
        self.monitor.stop_monitoring(transaction_id)
    }

    pub async fn start_verification(&self, transaction_id: &str) -> VerificationState {
        self.verification.start_verification(transaction_id).await
    }

    pub async fn start_verification_batched(&self, transaction_id: &str) -> VerificationState {
        self.verification
            .start_verification_batched(transaction_id)
            .await
    }

    pub fn subscribe_verification(&self) -> watch::Receiver<Snapshot<String, VerificationRun>> {
        self.verification.subscribe()
    }
}
