//! Trusted-device capability.
//!
//! Hosts that remember browsers ("don't ask again on this device") keep a
//! device record per (user, fingerprint). The framework defines the
//! capability and audits trust changes; what counts as a fingerprint is
//! host policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::Result;

/// A device a user has marked as trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedDevice {
    /// Owning user
    pub user_id: String,
    /// Host-defined stable fingerprint
    pub fingerprint: String,
    /// Display label ("Firefox on laptop")
    pub label: Option<String>,
    /// When trust was granted
    pub trusted_at: DateTime<Utc>,
    /// Last time the device was seen
    pub last_seen_at: DateTime<Utc>,
}

/// Trusted-device persistence.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Record (or refresh) trust for a device.
    async fn trust(&self, device: TrustedDevice) -> Result<()>;

    /// Whether the fingerprint is trusted for the user; updates last-seen
    /// when it is.
    async fn is_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool>;

    /// Remove trust. Returns whether a record existed.
    async fn remove(&self, user_id: &str, fingerprint: &str) -> Result<bool>;

    /// All trusted devices for a user.
    async fn list(&self, user_id: &str) -> Result<Vec<TrustedDevice>>;
}

/// In-memory [`DeviceStore`].
#[derive(Default)]
pub struct MemoryDevices {
    devices: DashMap<(String, String), TrustedDevice>,
}

impl MemoryDevices {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDevices {
    async fn trust(&self, device: TrustedDevice) -> Result<()> {
        self.devices.insert(
            (device.user_id.clone(), device.fingerprint.clone()),
            device,
        );
        Ok(())
    }

    async fn is_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        let key = (user_id.to_string(), fingerprint.to_string());
        if let Some(mut device) = self.devices.get_mut(&key) {
            device.last_seen_at = Utc::now();
            return Ok(true);
        }
        Ok(false)
    }

    async fn remove(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        Ok(self
            .devices
            .remove(&(user_id.to_string(), fingerprint.to_string()))
            .is_some())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TrustedDevice>> {
        Ok(self
            .devices
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// Postgres-backed [`DeviceStore`].
#[derive(Clone)]
pub struct PgDevices {
    pool: PgPool,
}

impl PgDevices {
    /// Wrap a pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgDevices {
    async fn trust(&self, device: TrustedDevice) -> Result<()> {
        sqlx::query(
            "INSERT INTO buffkit_trusted_devices \
             (user_id, fingerprint, label, trusted_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, fingerprint) \
             DO UPDATE SET label = EXCLUDED.label, last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(&device.user_id)
        .bind(&device.fingerprint)
        .bind(&device.label)
        .bind(device.trusted_at)
        .bind(device.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE buffkit_trusted_devices SET last_seen_at = NOW() \
             WHERE user_id = $1 AND fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM buffkit_trusted_devices WHERE user_id = $1 AND fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TrustedDevice>> {
        let rows = sqlx::query(
            "SELECT user_id, fingerprint, label, trusted_at, last_seen_at \
             FROM buffkit_trusted_devices WHERE user_id = $1 ORDER BY trusted_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TrustedDevice {
                    user_id: row.try_get("user_id")?,
                    fingerprint: row.try_get("fingerprint")?,
                    label: row.try_get("label")?,
                    trusted_at: row.try_get("trusted_at")?,
                    last_seen_at: row.try_get("last_seen_at")?,
                })
            })
            .collect()
    }
}
