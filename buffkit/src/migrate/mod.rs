//! SQL migrations: ordered scripts against a ledger table.
//!
//! Scripts live in a directory as `<version>_<name>.up.sql` /
//! `<version>_<name>.down.sql` pairs and are applied in lexical order.
//! Applied versions are recorded in `buffkit_migrations(version TEXT
//! PRIMARY KEY, applied_at TIMESTAMP)`; each script runs inside its own
//! transaction together with its ledger row.
//!
//! The framework's own schema (users, sessions, audit log, login
//! attempts) ships as embedded migrations applied through the same
//! ledger by [`MigrationRunner::bootstrap`].

use chrono::Utc;
use sqlx::{PgPool, Row};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A discovered migration script pair.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version string: the filename stem (lexical order is apply order)
    pub version: String,
    /// Up SQL
    pub up: String,
    /// Down SQL, when a `.down.sql` exists
    pub down: Option<String>,
}

/// Status of one known version.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Version string
    pub version: String,
    /// Whether the ledger records it as applied
    pub applied: bool,
}

/// Applies and rolls back migrations against a Postgres pool.
pub struct MigrationRunner {
    pool: PgPool,
    dir: PathBuf,
}

/// The framework's own schema, applied through the same ledger.
const FRAMEWORK_MIGRATIONS: &[(&str, &str)] = &[
    (
        "00000000000001_buffkit_users",
        r"CREATE TABLE IF NOT EXISTS buffkit_users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            password_digest TEXT NOT NULL,
            name TEXT,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            verified BOOLEAN NOT NULL DEFAULT FALSE,
            admin BOOLEAN NOT NULL DEFAULT FALSE,
            failed_logins INTEGER NOT NULL DEFAULT 0,
            locked_until TIMESTAMPTZ,
            extra JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS buffkit_users_email_idx ON buffkit_users (email);",
    ),
    (
        "00000000000002_buffkit_sessions",
        r"CREATE TABLE IF NOT EXISTS buffkit_sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            issued_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            last_activity_at TIMESTAMPTZ NOT NULL,
            ip TEXT,
            user_agent TEXT,
            data JSONB NOT NULL DEFAULT '{}'::jsonb
        );
        CREATE INDEX IF NOT EXISTS buffkit_sessions_user_idx ON buffkit_sessions (user_id);
        CREATE INDEX IF NOT EXISTS buffkit_sessions_expiry_idx ON buffkit_sessions (expires_at);",
    ),
    (
        "00000000000003_buffkit_audit_log",
        r"CREATE TABLE IF NOT EXISTS buffkit_audit_log (
            id BIGSERIAL PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            user_id TEXT,
            ip TEXT,
            user_agent TEXT,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS buffkit_audit_created_idx ON buffkit_audit_log (created_at);",
    ),
    (
        "00000000000004_buffkit_login_attempts",
        r"CREATE TABLE IF NOT EXISTS buffkit_login_attempts (
            id BIGSERIAL PRIMARY KEY,
            email TEXT NOT NULL,
            ip TEXT NOT NULL,
            success BOOLEAN NOT NULL,
            at TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS buffkit_attempts_email_idx ON buffkit_login_attempts (email, at);
        CREATE INDEX IF NOT EXISTS buffkit_attempts_ip_idx ON buffkit_login_attempts (ip, at);",
    ),
    (
        "00000000000005_buffkit_trusted_devices",
        r"CREATE TABLE IF NOT EXISTS buffkit_trusted_devices (
            user_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            label TEXT,
            trusted_at TIMESTAMPTZ NOT NULL,
            last_seen_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, fingerprint)
        );",
    ),
];

impl MigrationRunner {
    /// Create a runner over a pool and a migrations directory.
    #[must_use]
    pub fn new(pool: PgPool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
        }
    }

    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::raw_sql(
            r"CREATE TABLE IF NOT EXISTS buffkit_migrations (
                version TEXT PRIMARY KEY,
                applied_at TIMESTAMP NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT version FROM buffkit_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("version").map_err(Error::from))
            .collect()
    }

    async fn apply_one(&self, version: &str, up: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(up).execute(&mut *tx).await.map_err(|e| {
            Error::Migration(format!("migration '{version}' failed: {e}"))
        })?;
        sqlx::query("INSERT INTO buffkit_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version, "migration applied");
        Ok(())
    }

    /// Apply the framework's embedded schema migrations.
    pub async fn bootstrap(&self) -> Result<usize> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;
        let mut count = 0;
        for (version, up) in FRAMEWORK_MIGRATIONS {
            if !applied.iter().any(|v| v == version) {
                self.apply_one(version, up).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Apply all pending migrations from the directory, in lexical order.
    /// Returns the versions applied.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;
        let mut done = Vec::new();
        for migration in discover(&self.dir)? {
            if applied.iter().any(|v| *v == migration.version) {
                continue;
            }
            self.apply_one(&migration.version, &migration.up).await?;
            done.push(migration.version);
        }
        Ok(done)
    }

    /// Roll back the last `n` applied migrations. Every targeted version
    /// must have a down script; nothing is rolled back otherwise.
    pub async fn rollback(&self, n: usize) -> Result<Vec<String>> {
        self.ensure_ledger().await?;
        let mut applied = self.applied_versions().await?;
        applied.retain(|v| !v.starts_with("00000000000")); // framework schema stays
        applied.reverse();
        let targets: Vec<String> = applied.into_iter().take(n).collect();

        let migrations = discover(&self.dir)?;
        let mut pairs = Vec::new();
        for version in &targets {
            let down = migrations
                .iter()
                .find(|m| m.version == *version)
                .and_then(|m| m.down.clone())
                .ok_or_else(|| {
                    Error::Migration(format!("no down script for '{version}'"))
                })?;
            pairs.push((version.clone(), down));
        }

        let mut done = Vec::new();
        for (version, down) in pairs {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(&down).execute(&mut *tx).await.map_err(|e| {
                Error::Migration(format!("rollback of '{version}' failed: {e}"))
            })?;
            sqlx::query("DELETE FROM buffkit_migrations WHERE version = $1")
                .bind(&version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(version = %version, "migration rolled back");
            done.push(version);
        }
        Ok(done)
    }

    /// Applied and pending versions, in lexical order.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;
        let mut statuses: Vec<MigrationStatus> = discover(&self.dir)?
            .into_iter()
            .map(|m| MigrationStatus {
                applied: applied.iter().any(|v| *v == m.version),
                version: m.version,
            })
            .collect();
        // Versions in the ledger without a file on disk still show up.
        for version in applied {
            if !statuses.iter().any(|s| s.version == version) {
                statuses.push(MigrationStatus {
                    version,
                    applied: true,
                });
            }
        }
        statuses.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(statuses)
    }
}

/// Scaffold `<timestamp>_<name>.up.sql` and `.down.sql` in `dir`.
/// Returns the new version string.
pub fn create_scaffold(dir: &Path, name: &str) -> Result<String> {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let version = format!("{}_{slug}", Utc::now().format("%Y%m%d%H%M%S"));

    std::fs::create_dir_all(dir)?;
    std::fs::write(
        dir.join(format!("{version}.up.sql")),
        "-- up migration\n",
    )?;
    std::fs::write(
        dir.join(format!("{version}.down.sql")),
        "-- down migration\n",
    )?;
    Ok(version)
}

/// Read the migration directory into ordered script pairs. A missing
/// directory is an empty set.
pub fn discover(dir: &Path) -> Result<Vec<Migration>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut migrations = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(version) = filename.strip_suffix(".up.sql") else {
            continue;
        };
        let up = std::fs::read_to_string(&path)?;
        let down_path = dir.join(format!("{version}.down.sql"));
        let down = match std::fs::read_to_string(&down_path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::Io(e)),
        };
        migrations.push(Migration {
            version: version.to_string(),
            up,
            down,
        });
    }
    migrations.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_orders_lexically() {
        let dir = tempfile::tempdir().unwrap();
        for (version, sql) in [
            ("20260102000000_second", "SELECT 2;"),
            ("20260101000000_first", "SELECT 1;"),
        ] {
            std::fs::write(dir.path().join(format!("{version}.up.sql")), sql).unwrap();
        }
        std::fs::write(
            dir.path().join("20260101000000_first.down.sql"),
            "SELECT 0;",
        )
        .unwrap();

        let migrations = discover(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, "20260101000000_first");
        assert!(migrations[0].down.is_some());
        assert_eq!(migrations[1].version, "20260102000000_second");
        assert!(migrations[1].down.is_none());
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        assert!(discover(Path::new("/does/not/exist")).unwrap().is_empty());
    }

    #[test]
    fn test_create_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let version = create_scaffold(dir.path(), "Add Widgets!").unwrap();
        assert!(version.ends_with("_add_widgets_"));
        assert!(dir.path().join(format!("{version}.up.sql")).exists());
        assert!(dir.path().join(format!("{version}.down.sql")).exists());

        // Scaffolded files are discoverable.
        let migrations = discover(dir.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        assert!(migrations[0].down.is_some());
    }

    #[test]
    fn test_framework_migrations_are_ordered() {
        let versions: Vec<&str> = FRAMEWORK_MIGRATIONS.iter().map(|(v, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }
}
