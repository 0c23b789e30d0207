//! In-memory store implementations for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::model::{LoginAttempt, NewUser, Session, User};
use super::store::{LoginAttemptStore, SessionStore, UserStore};
use crate::error::{Error, Result};

/// In-memory [`UserStore`].
#[derive(Default)]
pub struct MemoryUsers {
    by_id: DashMap<String, User>,
    id_by_email: DashMap<String, String>,
}

impl MemoryUsers {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUsers {
    async fn create(&self, user: NewUser) -> Result<User> {
        let email = user.email.to_lowercase();
        if self.id_by_email.contains_key(&email) {
            return Err(Error::invalid_field("email", "email is already taken"));
        }
        let now = Utc::now();
        let record = User {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            password_digest: user.password_digest,
            name: user.name,
            active: true,
            verified: false,
            admin: false,
            failed_logins: 0,
            locked_until: None,
            extra: user.extra,
            created_at: now,
            updated_at: now,
        };
        self.id_by_email.insert(email, record.id.clone());
        self.by_id.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_lowercase();
        Ok(self
            .id_by_email
            .get(&email)
            .and_then(|id| self.by_id.get(id.value()).map(|u| u.clone())))
    }

    async fn by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.by_id.get(id).map(|u| u.clone()))
    }

    async fn update_password(&self, id: &str, digest: &str) -> Result<()> {
        let mut user = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        user.password_digest = digest.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn exists_email(&self, email: &str) -> Result<bool> {
        Ok(self.id_by_email.contains_key(&email.to_lowercase()))
    }

    async fn record_login_failure(
        &self,
        id: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let mut user = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        user.failed_logins += 1;
        if locked_until.is_some() {
            user.locked_until = locked_until;
        }
        user.updated_at = Utc::now();
        Ok(user.failed_logins)
    }

    async fn reset_login_failures(&self, id: &str) -> Result<()> {
        let mut user = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        user.failed_logins = 0;
        user.locked_until = None;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn unlock_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut unlocked = 0;
        for mut entry in self.by_id.iter_mut() {
            if entry.locked_until.map(|u| u <= now).unwrap_or(false) {
                entry.locked_until = None;
                entry.failed_logins = 0;
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessions {
    sessions: DashMap<String, Session>,
}

impl MemorySessions {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions (tests and stats).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn insert(&self, session: Session) -> Result<()> {
        if self.sessions.contains_key(&session.token) {
            return Err(Error::Session("session token collision".into()));
        }
        self.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(token).map(|s| s.clone()))
    }

    async fn delete(&self, token: &str) -> Result<()> {
        self.sessions.remove(token);
        Ok(())
    }

    async fn touch(
        &self,
        token: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.last_activity_at = last_activity_at;
            if let Some(expires_at) = expires_at {
                session.expires_at = expires_at;
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        Ok((before - self.sessions.len()) as u64)
    }

    async fn put_data(&self, token: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| Error::Session("no such session".into()))?;
        session.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn take_data(&self, token: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut session = match self.sessions.get_mut(token) {
            Some(session) => session,
            None => return Ok(None),
        };
        Ok(session.data.remove(key))
    }
}

/// In-memory [`LoginAttemptStore`].
#[derive(Default)]
pub struct MemoryLoginAttempts {
    attempts: Mutex<Vec<LoginAttempt>>,
}

impl MemoryLoginAttempts {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryLoginAttempts {
    async fn record(&self, attempt: LoginAttempt) -> Result<()> {
        self.attempts
            .lock()
            .expect("attempt store poisoned")
            .push(attempt);
        Ok(())
    }

    async fn count_for_email_since(&self, email: &str, since: DateTime<Utc>) -> Result<u32> {
        let email = email.to_lowercase();
        Ok(self
            .attempts
            .lock()
            .expect("attempt store poisoned")
            .iter()
            .filter(|a| a.email == email && a.at >= since && !a.success)
            .count() as u32)
    }

    async fn count_for_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .attempts
            .lock()
            .expect("attempt store poisoned")
            .iter()
            .filter(|a| a.ip == ip && a.at >= since)
            .count() as u32)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut attempts = self.attempts.lock().expect("attempt store poisoned");
        let before = attempts.len();
        attempts.retain(|a| a.at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }
}
