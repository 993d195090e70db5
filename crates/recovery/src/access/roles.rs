//! Admin roles, permissions and the role directory.

use audit::{AuditEvent, AuditSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Admin roles, ordered from least to most privileged. A role covers every
/// role below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminRole {
    SupportAgent,
    RecoverySpecialist,
    SystemAdmin,
    SecurityAdmin,
}

impl AdminRole {
    /// Whether this role includes `required` in its hierarchy.
    #[must_use]
    pub fn covers(self, required: AdminRole) -> bool {
        self >= required
    }

    #[must_use]
    pub fn has_permission(self, permission: Permission) -> bool {
        match self {
            AdminRole::SecurityAdmin => true,
            AdminRole::SystemAdmin => permission != Permission::SecurityOverride,
            AdminRole::RecoverySpecialist => matches!(
                permission,
                Permission::ReadBasic
                    | Permission::ReadDetails
                    | Permission::Initiate
                    | Permission::Cancel
                    | Permission::ManualIntervention
            ),
            AdminRole::SupportAgent => {
                matches!(permission, Permission::ReadBasic | Permission::ReadDetails)
            }
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AdminRole::SupportAgent => "SUPPORT_AGENT",
            AdminRole::RecoverySpecialist => "RECOVERY_SPECIALIST",
            AdminRole::SystemAdmin => "SYSTEM_ADMIN",
            AdminRole::SecurityAdmin => "SECURITY_ADMIN",
        }
    }
}

impl fmt::Display for AdminRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ReadBasic,
    ReadDetails,
    Initiate,
    Cancel,
    Rollback,
    ManualIntervention,
    SecurityOverride,
}

impl Permission {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::ReadBasic => "READ_BASIC",
            Permission::ReadDetails => "READ_DETAILS",
            Permission::Initiate => "INITIATE",
            Permission::Cancel => "CANCEL",
            Permission::Rollback => "ROLLBACK",
            Permission::ManualIntervention => "MANUAL_INTERVENTION",
            Permission::SecurityOverride => "SECURITY_OVERRIDE",
        }
    }
}

/// Recovery operations subject to access checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryOperation {
    ViewStatus,
    InitiateRecovery,
    CancelRecovery,
    RollbackTransaction,
    ManualIntervention,
}

impl RecoveryOperation {
    pub const ALL: [RecoveryOperation; 5] = [
        RecoveryOperation::ViewStatus,
        RecoveryOperation::InitiateRecovery,
        RecoveryOperation::CancelRecovery,
        RecoveryOperation::RollbackTransaction,
        RecoveryOperation::ManualIntervention,
    ];

    /// Permissions an admin needs for the operation out of the box.
    #[must_use]
    pub fn default_permissions(self) -> BTreeSet<Permission> {
        let permissions: &[Permission] = match self {
            RecoveryOperation::ViewStatus => &[Permission::ReadBasic, Permission::ReadDetails],
            RecoveryOperation::InitiateRecovery => &[
                Permission::Initiate,
                Permission::ReadBasic,
                Permission::ReadDetails,
            ],
            RecoveryOperation::CancelRecovery => &[Permission::Cancel, Permission::ReadBasic],
            RecoveryOperation::RollbackTransaction => {
                &[Permission::Rollback, Permission::ReadDetails]
            }
            RecoveryOperation::ManualIntervention => {
                &[Permission::ManualIntervention, Permission::ReadDetails]
            }
        };
        permissions.iter().copied().collect()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryOperation::ViewStatus => "VIEW_STATUS",
            RecoveryOperation::InitiateRecovery => "INITIATE_RECOVERY",
            RecoveryOperation::CancelRecovery => "CANCEL_RECOVERY",
            RecoveryOperation::RollbackTransaction => "ROLLBACK_TRANSACTION",
            RecoveryOperation::ManualIntervention => "MANUAL_INTERVENTION",
        }
    }
}

impl fmt::Display for RecoveryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission set required per operation, shared by every component that
/// gates on an operation.
#[derive(Debug)]
pub struct OperationPermissions {
    required: Mutex<HashMap<RecoveryOperation, BTreeSet<Permission>>>,
}

impl Default for OperationPermissions {
    fn default() -> Self {
        Self {
            required: Mutex::new(
                RecoveryOperation::ALL
                    .iter()
                    .map(|op| (*op, op.default_permissions()))
                    .collect(),
            ),
        }
    }
}

impl OperationPermissions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(&self, operation: RecoveryOperation) -> BTreeSet<Permission> {
        self.required
            .lock()
            .get(&operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, operation: RecoveryOperation, permissions: BTreeSet<Permission>) {
        self.required.lock().insert(operation, permissions);
    }

    /// Whether `role` grants every permission `operation` needs.
    pub fn allows(&self, role: AdminRole, operation: RecoveryOperation) -> bool {
        self.required(operation)
            .iter()
            .all(|p| role.has_permission(*p))
    }
}

fn join_roles(roles: &BTreeSet<AdminRole>) -> String {
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Role assignments per admin.
pub struct RoleDirectory {
    roles: Mutex<HashMap<String, BTreeSet<AdminRole>>>,
    audit: Arc<dyn AuditSink>,
}

impl RoleDirectory {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            roles: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Replace an admin's role set.
    pub fn assign_roles(&self, admin_id: &str, roles: impl IntoIterator<Item = AdminRole>) {
        let roles: BTreeSet<AdminRole> = roles.into_iter().collect();
        let joined = join_roles(&roles);
        self.roles.lock().insert(admin_id.to_string(), roles);
        self.audit.log_event(
            AuditEvent::new("ROLES_ASSIGNED", "Roles assigned to admin")
                .with("admin_id", admin_id)
                .with("roles", joined),
        );
    }

    pub fn remove_roles(&self, admin_id: &str, roles: impl IntoIterator<Item = AdminRole>) {
        let removed: BTreeSet<AdminRole> = roles.into_iter().collect();
        let remaining = {
            let mut all = self.roles.lock();
            let current = all.entry(admin_id.to_string()).or_default();
            current.retain(|r| !removed.contains(r));
            current.clone()
        };
        self.audit.log_event(
            AuditEvent::new("ROLES_REMOVED", "Roles removed from admin")
                .with("admin_id", admin_id)
                .with("removed_roles", join_roles(&removed))
                .with("remaining_roles", join_roles(&remaining)),
        );
    }

    pub fn admin_roles(&self, admin_id: &str) -> BTreeSet<AdminRole> {
        self.roles.lock().get(admin_id).cloned().unwrap_or_default()
    }

    /// Most privileged role held by the admin.
    pub fn highest_role(&self, admin_id: &str) -> Option<AdminRole> {
        self.roles
            .lock()
            .get(admin_id)
            .and_then(|roles| roles.iter().max().copied())
    }

    pub fn admin_exists(&self, admin_id: &str) -> bool {
        self.roles.lock().contains_key(admin_id)
    }

    pub fn list_admins_with_role(&self, role: AdminRole) -> Vec<String> {
        let mut admins: Vec<String> = self
            .roles
            .lock()
            .iter()
            .filter(|(_, roles)| roles.contains(&role))
            .map(|(admin, _)| admin.clone())
            .collect();
        admins.sort();
        admins
    }

    /// Whether any of the admin's roles covers `required`.
    pub fn has_required_role(&self, admin_id: &str, required: AdminRole) -> bool {
        let has_access = self
            .roles
            .lock()
            .get(admin_id)
            .is_some_and(|roles| roles.iter().any(|r| r.covers(required)));
        debug!(admin_id, required_role = %required, has_access, "Role access check");
        self.audit.log_event(
            AuditEvent::new("ACCESS_CHECK", "Role access check performed")
                .with("admin_id", admin_id)
                .with("required_role", required)
                .with("has_access", has_access),
        );
        has_access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit::AuditLog;

    #[test]
    fn test_hierarchy_is_nested() {
        assert!(AdminRole::SecurityAdmin.covers(AdminRole::SupportAgent));
        assert!(AdminRole::RecoverySpecialist.covers(AdminRole::RecoverySpecialist));
        assert!(!AdminRole::SupportAgent.covers(AdminRole::RecoverySpecialist));
        assert!(!AdminRole::SystemAdmin.covers(AdminRole::SecurityAdmin));
    }

    #[test]
    fn test_role_permissions() {
        assert!(AdminRole::SecurityAdmin.has_permission(Permission::SecurityOverride));
        assert!(!AdminRole::SystemAdmin.has_permission(Permission::SecurityOverride));
        assert!(AdminRole::SystemAdmin.has_permission(Permission::Rollback));
        assert!(!AdminRole::RecoverySpecialist.has_permission(Permission::Rollback));
        assert!(AdminRole::RecoverySpecialist.has_permission(Permission::ManualIntervention));
        assert!(!AdminRole::SupportAgent.has_permission(Permission::Initiate));
    }

    #[test]
    fn test_operation_defaults() {
        assert_eq!(
            RecoveryOperation::CancelRecovery.default_permissions(),
            BTreeSet::from([Permission::Cancel, Permission::ReadBasic])
        );
        assert!(RecoveryOperation::ManualIntervention
            .default_permissions()
            .contains(&Permission::ManualIntervention));
    }

    #[test]
    fn test_directory_assign_remove_and_check() {
        let audit = Arc::new(AuditLog::in_memory());
        let directory = RoleDirectory::new(audit.clone());

        directory.assign_roles("alice", [AdminRole::SupportAgent, AdminRole::SystemAdmin]);
        directory.assign_roles("bob", [AdminRole::SupportAgent]);

        assert_eq!(directory.highest_role("alice"), Some(AdminRole::SystemAdmin));
        assert!(directory.has_required_role("alice", AdminRole::RecoverySpecialist));
        assert!(!directory.has_required_role("bob", AdminRole::RecoverySpecialist));
        assert!(!directory.has_required_role("nobody", AdminRole::SupportAgent));
        assert_eq!(
            directory.list_admins_with_role(AdminRole::SupportAgent),
            vec!["alice".to_string(), "bob".to_string()]
        );

        directory.remove_roles("alice", [AdminRole::SystemAdmin]);
        assert_eq!(directory.highest_role("alice"), Some(AdminRole::SupportAgent));
        assert!(directory.admin_exists("alice"));

        let trail = audit.trail();
        assert_eq!(trail.events_of_type("ROLES_ASSIGNED").len(), 2);
        assert_eq!(trail.events_of_type("ACCESS_CHECK").len(), 3);
        assert_eq!(
            trail.events_of_type("ROLES_REMOVED")[0].get("remaining_roles"),
            Some("SUPPORT_AGENT")
        );
    }
}
