//! Store capability traits.
//!
//! Each trait is one capability; a host implements the ones it supports
//! and hands them to [`wire`](crate::kit::wire). The framework ships
//! Postgres and in-memory implementations of all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::{LoginAttempt, NewUser, Session, User};
use crate::error::Result;

/// Account persistence.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create an account. Fails when the email is already taken.
    async fn create(&self, user: NewUser) -> Result<User>;

    /// Look up by email (case-insensitive).
    async fn by_email(&self, email: &str) -> Result<Option<User>>;

    /// Look up by id.
    async fn by_id(&self, id: &str) -> Result<Option<User>>;

    /// Replace the password digest.
    async fn update_password(&self, id: &str, digest: &str) -> Result<()>;

    /// Whether an account exists for the email.
    async fn exists_email(&self, email: &str) -> Result<bool>;

    /// Record a failed login: bump the counter and, when the caller decided
    /// to lock, store the lock expiry. Returns the new counter value.
    async fn record_login_failure(
        &self,
        id: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<u32>;

    /// Reset the failed-login counter and clear any lock.
    async fn reset_login_failures(&self, id: &str) -> Result<()>;

    /// Clear locks that have expired by `now`. Returns how many accounts
    /// were unlocked. Run periodically by the scheduler.
    async fn unlock_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly issued session. Token collisions are a bug, not a
    /// recoverable condition; stores surface them as errors.
    async fn insert(&self, session: Session) -> Result<()>;

    /// Fetch by token.
    async fn get(&self, token: &str) -> Result<Option<Session>>;

    /// Delete by token (logout or expiry cleanup).
    async fn delete(&self, token: &str) -> Result<()>;

    /// Update last-activity and, when sliding expiry is on, the expiry.
    async fn touch(
        &self,
        token: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Remove sessions expired by `now`. Returns how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Set one key in the session's data map.
    async fn put_data(&self, token: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Remove and return one key from the session's data map.
    async fn take_data(&self, token: &str, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Login-attempt recording for the store-backed rate limiter.
#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    /// Append an attempt.
    async fn record(&self, attempt: LoginAttempt) -> Result<()>;

    /// Failed attempts for an email at or after `since`.
    async fn count_for_email_since(&self, email: &str, since: DateTime<Utc>) -> Result<u32>;

    /// Attempts from an address at or after `since`.
    async fn count_for_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<u32>;

    /// Drop attempts recorded before `cutoff`. Returns how many.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
