//! Append-only audit trail for security-relevant events.
//!
//! Every auth-visible action (logins, logouts, lockouts, session and
//! credential changes) is recorded as an [`AuditEntry`] through an
//! [`AuditStore`]. Entries are never updated or deleted individually;
//! the only mutation is age-based pruning by the scheduler.

mod pg;

pub use pg::PgAuditLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::Result;

/// The fixed set of auditable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Login attempt
    Login,
    /// Logout
    Logout,
    /// Account registration
    Register,
    /// Password reset flow
    PasswordReset,
    /// Password change
    PasswordUpdate,
    /// Email verification
    EmailVerification,
    /// Profile change
    ProfileUpdate,
    /// Account locked by the failed-attempt policy
    AccountLocked,
    /// Account unlocked (expiry sweep or admin)
    AccountUnlocked,
    /// Session issued
    SessionCreated,
    /// Session destroyed
    SessionDestroyed,
    /// Device marked trusted
    DeviceTrusted,
    /// Device trust removed
    DeviceRemoved,
    /// Two-factor enabled
    TwoFactorEnabled,
    /// Two-factor disabled
    TwoFactorDisabled,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Register => "register",
            Self::PasswordReset => "password_reset",
            Self::PasswordUpdate => "password_update",
            Self::EmailVerification => "email_verification",
            Self::ProfileUpdate => "profile_update",
            Self::AccountLocked => "account_locked",
            Self::AccountUnlocked => "account_unlocked",
            Self::SessionCreated => "session_created",
            Self::SessionDestroyed => "session_destroyed",
            Self::DeviceTrusted => "device_trusted",
            Self::DeviceRemoved => "device_removed",
            Self::TwoFactorEnabled => "two_factor_enabled",
            Self::TwoFactorDisabled => "two_factor_disabled",
        };
        write!(f, "{s}")
    }
}

/// Outcome recorded with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// The action succeeded
    Success,
    /// The action failed
    Failure,
    /// The action is awaiting completion (e.g. reset mail sent)
    Pending,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Event kind
    pub kind: AuditKind,
    /// Outcome
    pub status: AuditStatus,
    /// Acting or affected user, when known
    pub user_id: Option<String>,
    /// Source address
    pub ip: Option<String>,
    /// Source user agent
    pub user_agent: Option<String>,
    /// Free-form context
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Error text for failures
    pub error: Option<String>,
    /// When the entry was recorded
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Start an entry for a kind and status.
    #[must_use]
    pub fn new(kind: AuditKind, status: AuditStatus) -> Self {
        Self {
            kind,
            status,
            user_id: None,
            ip: None,
            user_agent: None,
            metadata: HashMap::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the user.
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the request origin.
    #[must_use]
    pub fn origin(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    /// Attach a metadata value.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Audit persistence.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an entry.
    async fn record(&self, entry: AuditEntry) -> Result<()>;

    /// Drop entries older than `cutoff`; returns how many.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory audit log for development and tests.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries (tests).
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit log poisoned").clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        tracing::debug!(kind = %entry.kind, status = ?entry.status, "audit entry");
        self.entries.lock().expect("audit log poisoned").push(entry);
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().expect("audit log poisoned");
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_record_and_prune() {
        let log = MemoryAuditLog::new();
        log.record(
            AuditEntry::new(AuditKind::Login, AuditStatus::Failure)
                .origin(Some("1.2.3.4".into()), None)
                .meta("email", "a@x.test")
                .with_error("wrong password"),
        )
        .await
        .unwrap();

        let mut old = AuditEntry::new(AuditKind::Logout, AuditStatus::Success);
        old.created_at = Utc::now() - Duration::days(100);
        log.record(old).await.unwrap();

        assert_eq!(log.entries().len(), 2);
        let pruned = log
            .prune_before(Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(log.entries()[0].kind, AuditKind::Login);
    }

    #[test]
    fn test_kind_display_is_snake_case() {
        assert_eq!(AuditKind::PasswordReset.to_string(), "password_reset");
        assert_eq!(AuditKind::SessionCreated.to_string(), "session_created");
    }
}
