//! Postgres store implementations.
//!
//! Schema lives in the framework's embedded migrations (see
//! [`crate::migrate`]); these implementations assume it has been applied.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use super::model::{LoginAttempt, NewUser, Session, User};
use super::store::{LoginAttemptStore, SessionStore, UserStore};
use crate::error::{Error, Result};

/// Postgres-backed [`UserStore`].
#[derive(Clone)]
pub struct PgUsers {
    pool: PgPool,
}

impl PgUsers {
    /// Wrap a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User> {
    let extra: serde_json::Value = row.try_get("extra")?;
    let extra: HashMap<String, serde_json::Value> = match extra {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_digest: row.try_get("password_digest")?,
        name: row.try_get("name")?,
        active: row.try_get("active")?,
        verified: row.try_get("verified")?,
        admin: row.try_get("admin")?,
        failed_logins: row.try_get::<i32, _>("failed_logins")?.max(0) as u32,
        locked_until: row.try_get("locked_until")?,
        extra,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const USER_COLUMNS: &str = "id, email, password_digest, name, active, verified, admin, \
                            failed_logins, locked_until, extra, created_at, updated_at";

#[async_trait]
impl UserStore for PgUsers {
    async fn create(&self, user: NewUser) -> Result<User> {
        let email = user.email.to_lowercase();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let extra = serde_json::Value::Object(user.extra.into_iter().collect());

        let row = sqlx::query(&format!(
            "INSERT INTO buffkit_users \
             (id, email, password_digest, name, active, verified, admin, \
              failed_logins, locked_until, extra, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, TRUE, FALSE, FALSE, 0, NULL, $5, $6, $6) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&id)
        .bind(&email)
        .bind(&user.password_digest)
        .bind(&user.name)
        .bind(&extra)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::invalid_field("email", "email is already taken")
            }
            _ => Error::from(e),
        })?;

        row_to_user(&row)
    }

    async fn by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM buffkit_users WHERE email = $1"
        ))
        .bind(email.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn by_id(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM buffkit_users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn update_password(&self, id: &str, digest: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE buffkit_users SET password_digest = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn exists_email(&self, email: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM buffkit_users WHERE email = $1")
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_login_failure(
        &self,
        id: &str,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE buffkit_users \
             SET failed_logins = failed_logins + 1, \
                 locked_until = COALESCE($2, locked_until), \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING failed_logins",
        )
        .bind(id)
        .bind(locked_until)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        Ok(row.try_get::<i32, _>("failed_logins")?.max(0) as u32)
    }

    async fn reset_login_failures(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE buffkit_users \
             SET failed_logins = 0, locked_until = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unlock_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE buffkit_users \
             SET locked_until = NULL, failed_logins = 0, updated_at = NOW() \
             WHERE locked_until IS NOT NULL AND locked_until <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Postgres-backed [`SessionStore`].
#[derive(Clone)]
pub struct PgSessions {
    pool: PgPool,
}

impl PgSessions {
    /// Wrap a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session> {
    let data: serde_json::Value = row.try_get("data")?;
    let data: HashMap<String, serde_json::Value> = match data {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    Ok(Session {
        token: row.try_get("token")?,
        user_id: row.try_get("user_id")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        data,
    })
}

#[async_trait]
impl SessionStore for PgSessions {
    async fn insert(&self, session: Session) -> Result<()> {
        let data = serde_json::Value::Object(session.data.into_iter().collect());
        sqlx::query(
            "INSERT INTO buffkit_sessions \
             (token, user_id, issued_at, expires_at, last_activity_at, ip, user_agent, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(session.issued_at)
        .bind(session.expires_at)
        .bind(session.last_activity_at)
        .bind(&session.ip)
        .bind(&session.user_agent)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Session("session token collision".into())
            }
            _ => Error::from(e),
        })?;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT token, user_id, issued_at, expires_at, last_activity_at, ip, user_agent, data \
             FROM buffkit_sessions WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn delete(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM buffkit_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch(
        &self,
        token: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE buffkit_sessions \
             SET last_activity_at = $2, expires_at = COALESCE($3, expires_at) \
             WHERE token = $1",
        )
        .bind(token)
        .bind(last_activity_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM buffkit_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn put_data(&self, token: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE buffkit_sessions \
             SET data = jsonb_set(data, ARRAY[$2], $3::jsonb, TRUE) \
             WHERE token = $1",
        )
        .bind(token)
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Session("no such session".into()));
        }
        Ok(())
    }

    async fn take_data(&self, token: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT data -> $2 AS taken FROM buffkit_sessions WHERE token = $1")
            .bind(token)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let value = match row {
            Some(row) => row.try_get::<Option<serde_json::Value>, _>("taken")?,
            None => return Ok(None),
        };
        if value.is_some() {
            sqlx::query("UPDATE buffkit_sessions SET data = data - $2 WHERE token = $1")
                .bind(token)
                .bind(key)
                .execute(&self.pool)
                .await?;
        }
        Ok(value)
    }
}

/// Postgres-backed [`LoginAttemptStore`].
#[derive(Clone)]
pub struct PgLoginAttempts {
    pool: PgPool,
}

impl PgLoginAttempts {
    /// Wrap a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoginAttemptStore for PgLoginAttempts {
    async fn record(&self, attempt: LoginAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO buffkit_login_attempts (email, ip, success, at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(attempt.email.to_lowercase())
        .bind(&attempt.ip)
        .bind(attempt.success)
        .bind(attempt.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_for_email_since(&self, email: &str, since: DateTime<Utc>) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM buffkit_login_attempts \
             WHERE email = $1 AND at >= $2 AND success = FALSE",
        )
        .bind(email.to_lowercase())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u32)
    }

    async fn count_for_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM buffkit_login_attempts WHERE ip = $1 AND at >= $2",
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u32)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM buffkit_login_attempts WHERE at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
