//! Manual intervention tickets.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::roles::{AdminRole, OperationPermissions, RecoveryOperation, RoleDirectory};
use super::session::SessionManager;
use crate::error::{EngineError, EngineResult};
use crate::store::{ObservableStore, Snapshot};
use crate::taxonomy::{Severity, TransactionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl InterventionPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl From<Severity> for InterventionPriority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
            Severity::Critical => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    Approved,
    Rejected,
}

impl TicketStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionTicket {
    pub ticket_id: String,
    pub transaction_id: String,
    pub error_id: String,
    pub reason: String,
    pub required_role: AdminRole,
    pub priority: InterventionPriority,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Outcome of approving or rejecting a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionResult {
    pub ticket_id: String,
    pub status: TicketStatus,
    pub message: String,
}

fn generate_ticket_id() -> String {
    format!("MI-{:08x}", rand::random::<u32>())
}

#[derive(Clone, Copy)]
enum Decision {
    Approve,
    Reject,
}

/// Ticket workflow gated by role, permission and session.
pub struct InterventionDesk {
    tickets: ObservableStore<String, InterventionTicket>,
    directory: Arc<RoleDirectory>,
    sessions: Arc<SessionManager>,
    permissions: Arc<OperationPermissions>,
    audit: Arc<dyn AuditSink>,
}

impl InterventionDesk {
    pub fn new(
        directory: Arc<RoleDirectory>,
        sessions: Arc<SessionManager>,
        permissions: Arc<OperationPermissions>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            tickets: ObservableStore::new(),
            directory,
            sessions,
            permissions,
            audit,
        }
    }

    /// Issue a PENDING ticket for `error`.
    pub fn create_intervention_request(
        &self,
        error: &TransactionError,
        error_id: &str,
        reason: &str,
        required_role: AdminRole,
        priority: InterventionPriority,
    ) -> InterventionTicket {
        let now = Utc::now();
        let ticket = InterventionTicket {
            ticket_id: generate_ticket_id(),
            transaction_id: error.transaction_id.clone(),
            error_id: error_id.to_string(),
            reason: reason.to_string(),
            required_role,
            priority,
            status: TicketStatus::Pending,
            created_at: now,
            last_updated: now,
            approved_by: None,
            approval_notes: None,
            rejected_by: None,
            rejection_reason: None,
        };
        self.tickets.insert(ticket.ticket_id.clone(), ticket.clone());

        info!(
            ticket_id = %ticket.ticket_id,
            transaction_id = %ticket.transaction_id,
            required_role = %required_role,
            "Manual intervention requested"
        );
        self.audit.log_event(
            AuditEvent::new("MANUAL_INTERVENTION_REQUESTED", "Manual intervention request created")
                .with("ticket_id", &ticket.ticket_id)
                .with("transaction_id", &ticket.transaction_id)
                .with("error_id", error_id)
                .with("required_role", required_role)
                .with("priority", priority.as_str()),
        );
        ticket
    }

    pub fn approve_intervention(
        &self,
        ticket_id: &str,
        admin_id: &str,
        notes: &str,
    ) -> EngineResult<InterventionResult> {
        self.decide(ticket_id, admin_id, notes, Decision::Approve)
    }

    pub fn reject_intervention(
        &self,
        ticket_id: &str,
        admin_id: &str,
        reason: &str,
    ) -> EngineResult<InterventionResult> {
        self.decide(ticket_id, admin_id, reason, Decision::Reject)
    }

    fn decide(
        &self,
        ticket_id: &str,
        admin_id: &str,
        notes: &str,
        decision: Decision,
    ) -> EngineResult<InterventionResult> {
        let key = ticket_id.to_string();
        let ticket = self
            .tickets
            .get(&key)
            .ok_or_else(|| EngineError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })?;

        let permitted = self.directory.has_required_role(admin_id, ticket.required_role)
            && self
                .directory
                .highest_role(admin_id)
                .is_some_and(|role| {
                    self.permissions
                        .allows(role, RecoveryOperation::ManualIntervention)
                });
        if !permitted {
            warn!(ticket_id, admin_id, required_role = %ticket.required_role, "Unauthorized intervention attempt");
            self.audit.log_event(
                AuditEvent::new("MANUAL_INTERVENTION_UNAUTHORIZED", "Unauthorized intervention attempt")
                    .with("ticket_id", ticket_id)
                    .with("admin_id", admin_id)
                    .with("required_role", ticket.required_role),
            );
            return Err(EngineError::Unauthorized {
                admin_id: admin_id.to_string(),
                operation: "MANUAL_INTERVENTION".to_string(),
            });
        }

        if !self.sessions.has_active_session(admin_id) {
            return Err(EngineError::SessionInvalid {
                admin_id: admin_id.to_string(),
            });
        }

        let updated = self.tickets.update(|tickets| {
            let Some(ticket) = tickets.get_mut(&key) else {
                return Err(EngineError::TicketNotFound {
                    ticket_id: key.clone(),
                });
            };
            if ticket.status != TicketStatus::Pending {
                return Err(EngineError::TicketNotPending {
                    ticket_id: key.clone(),
                    status: ticket.status.as_str().to_string(),
                });
            }
            ticket.last_updated = Utc::now();
            match decision {
                Decision::Approve => {
                    ticket.status = TicketStatus::Approved;
                    ticket.approved_by = Some(admin_id.to_string());
                    ticket.approval_notes = Some(notes.to_string());
                }
                Decision::Reject => {
                    ticket.status = TicketStatus::Rejected;
                    ticket.rejected_by = Some(admin_id.to_string());
                    ticket.rejection_reason = Some(notes.to_string());
                }
            }
            Ok(ticket.clone())
        })?;

        let (event_type, description, note_key, verb) = match decision {
            Decision::Approve => (
                "MANUAL_INTERVENTION_APPROVED",
                "Manual intervention request approved",
                "notes",
                "approved",
            ),
            Decision::Reject => (
                "MANUAL_INTERVENTION_REJECTED",
                "Manual intervention request rejected",
                "reason",
                "rejected",
            ),
        };
        info!(ticket_id, admin_id, decision = verb, "Intervention resolved");
        self.audit.log_event(
            AuditEvent::new(event_type, description)
                .with("ticket_id", ticket_id)
                .with("admin_id", admin_id)
                .with("transaction_id", &updated.transaction_id)
                .with(note_key, notes),
        );

        Ok(InterventionResult {
            ticket_id: ticket_id.to_string(),
            status: updated.status,
            message: format!("Intervention {verb} by admin: {admin_id}"),
        })
    }

    pub fn ticket(&self, ticket_id: &str) -> Option<InterventionTicket> {
        self.tickets.get(&ticket_id.to_string())
    }

    /// Pending tickets the admin's highest role can act on, highest priority
    /// first.
    pub fn list_intervention_requests(&self, admin_id: &str) -> Vec<InterventionTicket> {
        let Some(role) = self.directory.highest_role(admin_id) else {
            return Vec::new();
        };
        let mut pending: Vec<InterventionTicket> = self
            .tickets
            .snapshot()
            .values()
            .filter(|t| t.status == TicketStatus::Pending && role.covers(t.required_role))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        pending
    }

    pub fn tickets(&self) -> Snapshot<String, InterventionTicket> {
        self.tickets.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<String, InterventionTicket>> {
        self.tickets.subscribe()
    }
}
