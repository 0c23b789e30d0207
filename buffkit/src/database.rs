//! Database connection pool management

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::{
    config::DatabaseConfig,
    error::{sanitize_url, Error, Result},
};

/// Create a PostgreSQL connection pool with retry logic.
///
/// Retries with exponential backoff up to `config.max_retries` before
/// giving up; wiring treats the final failure as fatal.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt = 0u32;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        attempts = attempt + 1,
                        "database connection established after retries"
                    );
                } else {
                    tracing::info!(
                        max_connections = config.max_connections,
                        "database connection pool created"
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::error!(
                        attempts = attempt,
                        url = %sanitize_url(&config.url),
                        "failed to connect to database: {}",
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    "database connection attempt failed: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            Error::Config(format!(
                "failed to connect to database at '{}': {}",
                sanitize_url(&config.url),
                e
            ))
        })
}
