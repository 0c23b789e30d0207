//! Authentication domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An account.
///
/// The password digest is never serialized outbound; anything rendering a
/// user to JSON gets every field but that one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Opaque identifier
    pub id: String,
    /// Unique, matched case-insensitively (stored lowercased)
    pub email: String,
    /// PHC-format digest
    #[serde(skip_serializing)]
    pub password_digest: String,
    /// Display name
    pub name: Option<String>,
    /// Inactive users cannot authenticate
    pub active: bool,
    /// Email verified
    pub verified: bool,
    /// Administrative account
    pub admin: bool,
    /// Consecutive failed logins since the last success
    pub failed_logins: u32,
    /// Account lock expiry; a value in the past means unlocked
    pub locked_until: Option<DateTime<Utc>>,
    /// Open extension point for host data
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Whether the account is locked at `now`.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }

    /// Seconds until the lock expires (0 when unlocked).
    #[must_use]
    pub fn lock_remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| (until - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Fields for creating an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Email; normalized to lowercase by the store
    pub email: String,
    /// Already-hashed password digest
    pub password_digest: String,
    /// Display name
    pub name: Option<String>,
    /// Host extension data
    pub extra: HashMap<String, serde_json::Value>,
}

/// A login session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque token, at least 128 bits of entropy
    pub token: String,
    /// Owning user
    pub user_id: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Hard expiry; expired sessions refuse authentication
    pub expires_at: DateTime<Utc>,
    /// Last request seen with this session
    pub last_activity_at: DateTime<Utc>,
    /// Originating address
    pub ip: Option<String>,
    /// Originating user agent
    pub user_agent: Option<String>,
    /// Session-scoped data (flash messages and host values)
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl Session {
    /// Whether the session has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A recorded login attempt, used for sliding-window rate limiting.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    /// Email as submitted (lowercased)
    pub email: String,
    /// Source address
    pub ip: String,
    /// Whether the attempt succeeded
    pub success: bool,
    /// When it happened
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        let now = Utc::now();
        User {
            id: "u1".into(),
            email: "a@x.test".into(),
            password_digest: "$argon2id$...".into(),
            name: None,
            active: true,
            verified: false,
            admin: false,
            failed_logins: 0,
            locked_until: None,
            extra: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_lock_in_past_means_unlocked() {
        let now = Utc::now();
        let mut u = user();
        u.locked_until = Some(now - Duration::seconds(1));
        assert!(!u.is_locked(now));
        assert_eq!(u.lock_remaining_secs(now), 0);
    }

    #[test]
    fn test_lock_in_future() {
        let now = Utc::now();
        let mut u = user();
        u.locked_until = Some(now + Duration::seconds(120));
        assert!(u.is_locked(now));
        let remaining = u.lock_remaining_secs(now);
        assert!((119..=120).contains(&remaining));
    }

    #[test]
    fn test_password_digest_not_serialized() {
        let json = serde_json::to_value(user()).unwrap();
        assert!(json.get("password_digest").is_none());
        assert_eq!(json.get("email").unwrap(), "a@x.test");
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Session {
            token: "t".into(),
            user_id: "u1".into(),
            issued_at: now - Duration::hours(2),
            expires_at: now - Duration::seconds(1),
            last_activity_at: now,
            ip: None,
            user_agent: None,
            data: HashMap::new(),
        };
        assert!(session.is_expired(now));
    }
}
