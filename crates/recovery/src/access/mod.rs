//! Admin access control.
//!
//! Roles form a strict hierarchy (`SecurityAdmin` covers `SystemAdmin`
//! covers `RecoverySpecialist` covers `SupportAgent`). Each
//! [`RecoveryOperation`] maps to a permission set; an admin may perform the
//! operation when their highest role grants every permission in the set and
//! their session is live.

pub mod intervention;
pub mod roles;
pub mod session;

use audit::{AuditEvent, AuditSink};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

pub use intervention::{
    InterventionDesk, InterventionPriority, InterventionResult, InterventionTicket, TicketStatus,
};
pub use roles::{AdminRole, OperationPermissions, Permission, RecoveryOperation, RoleDirectory};
pub use session::{AdminSession, SessionManager};

fn join_permissions(permissions: &BTreeSet<Permission>) -> String {
    permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Operation-level access checks over the role directory and sessions.
pub struct AccessControl {
    directory: Arc<RoleDirectory>,
    sessions: Arc<SessionManager>,
    operation_permissions: Arc<OperationPermissions>,
    audit: Arc<dyn AuditSink>,
}

impl AccessControl {
    pub fn new(session_timeout: Duration, audit: Arc<dyn AuditSink>) -> Self {
        let directory = Arc::new(RoleDirectory::new(audit.clone()));
        let sessions = Arc::new(SessionManager::new(
            directory.clone(),
            session_timeout,
            audit.clone(),
        ));
        Self {
            directory,
            sessions,
            operation_permissions: Arc::new(OperationPermissions::new()),
            audit,
        }
    }

    pub fn directory(&self) -> &Arc<RoleDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn operation_permissions(&self, operation: RecoveryOperation) -> BTreeSet<Permission> {
        self.operation_permissions.required(operation)
    }

    /// The live permission table, for components that gate on operations
    /// outside `verify_access`.
    pub fn permission_table(&self) -> &Arc<OperationPermissions> {
        &self.operation_permissions
    }

    /// Whether the admin's highest role grants every permission `operation`
    /// needs. Does not look at sessions.
    pub fn permits(&self, admin_id: &str, operation: RecoveryOperation) -> bool {
        self.directory
            .highest_role(admin_id)
            .is_some_and(|role| self.operation_permissions.allows(role, operation))
    }

    /// Session and permission check for one operation.
    pub fn verify_access(
        &self,
        admin_id: &str,
        token: &str,
        operation: RecoveryOperation,
    ) -> EngineResult<()> {
        if !self.sessions.validate_session(admin_id, token) {
            self.deny(admin_id, operation, "Invalid session");
            return Err(EngineError::SessionInvalid {
                admin_id: admin_id.to_string(),
            });
        }

        if !self.permits(admin_id, operation) {
            self.deny(admin_id, operation, "Insufficient permissions");
            return Err(EngineError::Unauthorized {
                admin_id: admin_id.to_string(),
                operation: operation.to_string(),
            });
        }

        self.audit.log_event(
            AuditEvent::new("ACCESS_GRANTED", "Access granted")
                .with("admin_id", admin_id)
                .with("operation", operation),
        );
        Ok(())
    }

    fn deny(&self, admin_id: &str, operation: RecoveryOperation, reason: &str) {
        warn!(admin_id, %operation, reason, "Access denied");
        self.audit.log_event(
            AuditEvent::new("ACCESS_DENIED", "Access denied")
                .with("admin_id", admin_id)
                .with("operation", operation)
                .with("reason", reason),
        );
    }

    /// Replace the permission set of an operation. Only a `SecurityAdmin`
    /// with a live session may do this.
    pub fn update_operation_permissions(
        &self,
        admin_id: &str,
        token: &str,
        operation: RecoveryOperation,
        permissions: BTreeSet<Permission>,
    ) -> EngineResult<()> {
        if !self.sessions.validate_session(admin_id, token) {
            return Err(EngineError::SessionInvalid {
                admin_id: admin_id.to_string(),
            });
        }
        if self.directory.highest_role(admin_id) != Some(AdminRole::SecurityAdmin) {
            self.deny(admin_id, operation, "Only security admins can update permissions");
            return Err(EngineError::Unauthorized {
                admin_id: admin_id.to_string(),
                operation: "UPDATE_PERMISSIONS".to_string(),
            });
        }

        let joined = join_permissions(&permissions);
        self.operation_permissions.set(operation, permissions);
        info!(admin_id, %operation, permissions = %joined, "Operation permissions updated");
        self.audit.log_event(
            AuditEvent::new("PERMISSIONS_UPDATED", "Operation permissions updated")
                .with("admin_id", admin_id)
                .with("operation", operation)
                .with("permissions", joined),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit::AuditLog;

    fn access() -> (AccessControl, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        let access = AccessControl::new(Duration::from_secs(1800), audit.clone());
        access
            .directory()
            .assign_roles("agent", [AdminRole::SupportAgent]);
        access
            .directory()
            .assign_roles("specialist", [AdminRole::RecoverySpecialist]);
        access
            .directory()
            .assign_roles("root", [AdminRole::SecurityAdmin]);
        (access, audit)
    }

    #[test]
    fn test_verify_access_by_role() {
        let (access, audit) = access();
        let agent = access.sessions().authenticate("agent").unwrap();
        let specialist = access.sessions().authenticate("specialist").unwrap();

        assert!(access
            .verify_access("agent", &agent.token, RecoveryOperation::ViewStatus)
            .is_ok());
        assert!(matches!(
            access.verify_access("agent", &agent.token, RecoveryOperation::InitiateRecovery),
            Err(EngineError::Unauthorized { .. })
        ));
        assert!(access
            .verify_access(
                "specialist",
                &specialist.token,
                RecoveryOperation::CancelRecovery
            )
            .is_ok());
        assert!(access
            .verify_access(
                "specialist",
                &specialist.token,
                RecoveryOperation::RollbackTransaction
            )
            .is_err());

        let trail = audit.trail();
        assert_eq!(trail.events_of_type("ACCESS_GRANTED").len(), 2);
        assert_eq!(trail.events_of_type("ACCESS_DENIED").len(), 2);
    }

    #[test]
    fn test_verify_access_rejects_bad_token() {
        let (access, _) = access();
        access.sessions().authenticate("root").unwrap();
        assert!(matches!(
            access.verify_access("root", "not-a-token", RecoveryOperation::ViewStatus),
            Err(EngineError::SessionInvalid { .. })
        ));
    }

    #[test]
    fn test_only_security_admin_updates_permissions() {
        let (access, audit) = access();
        let specialist = access.sessions().authenticate("specialist").unwrap();
        let root = access.sessions().authenticate("root").unwrap();

        let relaxed = BTreeSet::from([Permission::ReadDetails]);
        assert!(access
            .update_operation_permissions(
                "specialist",
                &specialist.token,
                RecoveryOperation::RollbackTransaction,
                relaxed.clone(),
            )
            .unwrap_err()
            .is_authorization_error());

        access
            .update_operation_permissions(
                "root",
                &root.token,
                RecoveryOperation::RollbackTransaction,
                relaxed.clone(),
            )
            .unwrap();
        assert_eq!(
            access.operation_permissions(RecoveryOperation::RollbackTransaction),
            relaxed
        );
        assert!(access.permits("specialist", RecoveryOperation::RollbackTransaction));
        assert_eq!(audit.trail().events_of_type("PERMISSIONS_UPDATED").len(), 1);
    }
}
