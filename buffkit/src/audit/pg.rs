//! Postgres audit log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{AuditEntry, AuditStore};
use crate::error::Result;

/// Postgres-backed [`AuditStore`]. Append-only by construction: the only
/// statements issued are INSERT and the age-based DELETE.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    /// Wrap a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        let metadata = serde_json::Value::Object(entry.metadata.into_iter().collect());
        sqlx::query(
            "INSERT INTO buffkit_audit_log \
             (kind, status, user_id, ip, user_agent, metadata, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.kind.to_string())
        .bind(match entry.status {
            super::AuditStatus::Success => "success",
            super::AuditStatus::Failure => "failure",
            super::AuditStatus::Pending => "pending",
        })
        .bind(&entry.user_id)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&metadata)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM buffkit_audit_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
