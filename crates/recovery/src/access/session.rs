//! Admin sessions with an idle timeout.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::roles::RoleDirectory;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSession {
    pub admin_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AdminSession {
    fn is_live(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now < self.last_activity + timeout
    }
}

/// Opaque session token: hex SHA-256 of 32 random bytes.
fn generate_token() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(Sha256::digest(seed))
}

/// One session per admin, keyed by admin id.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, AdminSession>>,
    directory: Arc<RoleDirectory>,
    timeout: chrono::Duration,
    audit: Arc<dyn AuditSink>,
}

impl SessionManager {
    pub fn new(directory: Arc<RoleDirectory>, timeout: Duration, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            directory,
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::minutes(30)),
            audit,
        }
    }

    /// Open a session, reusing one that is still live.
    pub fn authenticate(&self, admin_id: &str) -> EngineResult<AdminSession> {
        if !self.directory.admin_exists(admin_id) {
            warn!(admin_id, "Authentication failed for unknown admin");
            self.audit.log_event(
                AuditEvent::new("AUTH_FAILED", "Authentication failed")
                    .with("admin_id", admin_id)
                    .with("reason", "Unknown admin"),
            );
            return Err(EngineError::UnknownAdmin {
                admin_id: admin_id.to_string(),
            });
        }

        let now = Utc::now();
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(admin_id) {
                Some(existing) if existing.is_live(self.timeout, now) => {
                    existing.last_activity = now;
                    existing.clone()
                }
                _ => {
                    let session = AdminSession {
                        admin_id: admin_id.to_string(),
                        token: generate_token(),
                        created_at: now,
                        last_activity: now,
                    };
                    sessions.insert(admin_id.to_string(), session.clone());
                    session
                }
            }
        };

        info!(admin_id, "Admin authenticated");
        self.audit.log_event(
            AuditEvent::new("AUTH_SUCCESS", "Admin authenticated")
                .with("admin_id", admin_id)
                .with("session_created_at", session.created_at.to_rfc3339()),
        );
        Ok(session)
    }

    /// Check a token and refresh the session's activity time.
    pub fn validate_session(&self, admin_id: &str, token: &str) -> bool {
        self.validate_at(admin_id, Some(token), Utc::now())
    }

    /// Whether the admin holds a live session; refreshes it when so.
    pub fn has_active_session(&self, admin_id: &str) -> bool {
        self.validate_at(admin_id, None, Utc::now())
    }

    /// Validation against an explicit clock. `token: None` skips the token
    /// comparison.
    pub fn validate_at(&self, admin_id: &str, token: Option<&str>, now: DateTime<Utc>) -> bool {
        enum Outcome {
            Valid,
            Invalid,
            Expired,
        }

        let outcome = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(admin_id) {
                None => Outcome::Invalid,
                Some(session) if token.is_some_and(|t| t != session.token) => Outcome::Invalid,
                Some(session) if !session.is_live(self.timeout, now) => {
                    sessions.remove(admin_id);
                    Outcome::Expired
                }
                Some(session) => {
                    session.last_activity = now;
                    Outcome::Valid
                }
            }
        };

        match outcome {
            Outcome::Valid => true,
            Outcome::Invalid => {
                self.audit.log_event(
                    AuditEvent::new("SESSION_INVALID", "Session validation failed")
                        .with("admin_id", admin_id),
                );
                false
            }
            Outcome::Expired => {
                info!(admin_id, "Admin session expired");
                self.audit.log_event(
                    AuditEvent::new("SESSION_EXPIRED", "Admin session expired")
                        .with("admin_id", admin_id),
                );
                false
            }
        }
    }

    /// Drop the admin's session. Returns whether one existed.
    pub fn invalidate_session(&self, admin_id: &str) -> bool {
        let removed = self.sessions.lock().remove(admin_id).is_some();
        if removed {
            self.audit.log_event(
                AuditEvent::new("SESSION_INVALIDATED", "Admin session invalidated")
                    .with("admin_id", admin_id),
            );
        }
        removed
    }

    pub fn session(&self, admin_id: &str) -> Option<AdminSession> {
        self.sessions.lock().get(admin_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::roles::AdminRole;
    use audit::AuditLog;

    fn manager() -> (SessionManager, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        let directory = Arc::new(RoleDirectory::new(audit.clone()));
        directory.assign_roles("ops-1", [AdminRole::RecoverySpecialist]);
        (
            SessionManager::new(directory, Duration::from_secs(30 * 60), audit.clone()),
            audit,
        )
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_authenticate_reuses_live_session() {
        let (manager, audit) = manager();
        let first = manager.authenticate("ops-1").unwrap();
        let second = manager.authenticate("ops-1").unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(audit.trail().events_of_type("AUTH_SUCCESS").len(), 2);

        assert!(matches!(
            manager.authenticate("ghost"),
            Err(EngineError::UnknownAdmin { .. })
        ));
        assert_eq!(audit.trail().events_of_type("AUTH_FAILED").len(), 1);
    }

    #[test]
    fn test_validate_checks_token_and_refreshes() {
        let (manager, _) = manager();
        let session = manager.authenticate("ops-1").unwrap();

        assert!(!manager.validate_session("ops-1", "forged"));
        let later = session.last_activity + chrono::Duration::minutes(20);
        assert!(manager.validate_at("ops-1", Some(&session.token), later));
        assert_eq!(manager.session("ops-1").unwrap().last_activity, later);

        // Still live 20 minutes after the refresh, 40 after creation.
        let much_later = later + chrono::Duration::minutes(20);
        assert!(manager.validate_at("ops-1", Some(&session.token), much_later));
    }

    #[test]
    fn test_expired_session_is_removed() {
        let (manager, audit) = manager();
        let session = manager.authenticate("ops-1").unwrap();
        let expired = session.last_activity + chrono::Duration::minutes(30);

        assert!(!manager.validate_at("ops-1", Some(&session.token), expired));
        assert!(manager.session("ops-1").is_none());
        assert_eq!(audit.trail().events_of_type("SESSION_EXPIRED").len(), 1);

        let fresh = manager.authenticate("ops-1").unwrap();
        assert_ne!(fresh.token, session.token);
    }

    #[test]
    fn test_invalidate() {
        let (manager, audit) = manager();
        let session = manager.authenticate("ops-1").unwrap();
        assert!(manager.invalidate_session("ops-1"));
        assert!(!manager.invalidate_session("ops-1"));
        assert!(!manager.validate_session("ops-1", &session.token));
        assert_eq!(audit.trail().events_of_type("SESSION_INVALIDATED").len(), 1);
    }
}
