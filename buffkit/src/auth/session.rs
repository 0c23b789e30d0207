//! Session issue, lookup, and cookie handling.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

use super::model::{Session, User};
use super::store::{SessionStore, UserStore};
use crate::config::SessionConfig;
use crate::error::Result;

/// Issues, authenticates, and revokes sessions over a [`SessionStore`].
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionService {
    /// Create a service over a store.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    /// Cookie name sessions travel under.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Issue a session for a user.
    ///
    /// The token carries 256 bits from the OS RNG, base64url-encoded.
    pub async fn issue(
        &self,
        user_id: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            token: generate_token(),
            user_id: user_id.to_string(),
            issued_at: now,
            expires_at: now + Duration::seconds(self.config.ttl_secs as i64),
            last_activity_at: now,
            ip,
            user_agent,
            data: HashMap::new(),
        };
        self.store.insert(session.clone()).await?;
        tracing::debug!(user_id, "session issued");
        Ok(session)
    }

    /// Authenticate a token: the session must exist, be unexpired, and
    /// belong to an active user. Last-activity is updated; expiry is
    /// extended only when sliding sessions are configured.
    ///
    /// Expired sessions are deleted on sight and treated as anonymous.
    pub async fn authenticate(
        &self,
        token: &str,
        users: &dyn UserStore,
    ) -> Result<Option<(Session, User)>> {
        let Some(session) = self.store.get(token).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if session.is_expired(now) {
            self.store.delete(token).await?;
            return Ok(None);
        }

        let Some(user) = users.by_id(&session.user_id).await? else {
            self.store.delete(token).await?;
            return Ok(None);
        };
        if !user.active {
            return Ok(None);
        }

        let new_expiry = self
            .config
            .sliding
            .then(|| now + Duration::seconds(self.config.ttl_secs as i64));
        self.store.touch(token, now, new_expiry).await?;

        Ok(Some((session, user)))
    }

    /// Destroy a session.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.store.delete(token).await
    }

    /// Remove expired sessions; returns how many went.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.delete_expired(Utc::now()).await
    }

    /// Build the `Set-Cookie` value for a session token.
    #[must_use]
    pub fn cookie_for(&self, token: &str, tls: bool) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.config.cookie_name, token, self.config.ttl_secs
        );
        if tls || self.config.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Build the `Set-Cookie` value that clears the session cookie.
    #[must_use]
    pub fn clearing_cookie(&self, tls: bool) -> String {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            self.config.cookie_name
        );
        if tls || self.config.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Generate a session token: 32 bytes of OS randomness, base64url.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Extract one cookie's value from a `Cookie` request header.
#[must_use]
pub fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
