//! Periodic task scheduling on cron specs.
//!
//! Specs use the classic 5-field vocabulary with minute resolution
//! (`min hour dom month dow`); a seconds field of `0` is prepended
//! internally. 6-field specs are accepted as-is, which the tests use for
//! sub-minute cadences.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use super::runtime::JobClient;
use super::task::EnqueueOptions;
use crate::error::{Error, Result};

struct Entry {
    kind: String,
    schedule: Schedule,
    options: EnqueueOptions,
}

/// In-process schedule loop that enqueues a task at each cron fire.
///
/// A due fire is never skipped silently: every entry whose fire time has
/// arrived by the time the loop wakes is enqueued, even when the loop ran
/// behind.
pub struct Scheduler {
    client: JobClient,
    entries: Vec<Entry>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler enqueueing through `client`.
    #[must_use]
    pub fn new(client: JobClient) -> Self {
        Self {
            client,
            entries: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a periodic enqueue of `kind` on a cron spec.
    ///
    /// # Errors
    ///
    /// [`Error::Job`] when the spec does not parse.
    pub fn every(&mut self, spec: &str, kind: impl Into<String>, options: EnqueueOptions) -> Result<()> {
        let schedule = parse_spec(spec)?;
        self.entries.push(Entry {
            kind: kind.into(),
            schedule,
            options,
        });
        Ok(())
    }

    /// Register the framework's standard maintenance cadence:
    /// session cleanup hourly, account unlock every 15 minutes, audit
    /// cleanup daily at 03:00, password-expiry checks daily at 09:00, and
    /// inactive-user notification Mondays at 10:00.
    pub fn register_standard(&mut self) -> Result<()> {
        let low = || EnqueueOptions::default().on_queue("low");
        self.every("0 * * * *", "auth:cleanup_sessions", low())?;
        self.every("*/15 * * * *", "auth:unlock_accounts", low())?;
        self.every("0 3 * * *", "audit:cleanup", low())?;
        self.every("0 9 * * *", "auth:password_expiry", low())?;
        self.every("0 10 * * Mon", "auth:notify_inactive", low())?;
        Ok(())
    }

    /// Registered (spec-resolved) kinds, for the CLI to report.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.kind.clone()).collect()
    }

    /// A token that stops [`run`](Self::run) when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the schedule loop until cancelled.
    pub async fn run(self) {
        if self.entries.is_empty() {
            tracing::warn!("scheduler started with no entries");
            return;
        }
        tracing::info!(entries = self.entries.len(), "scheduler running");

        // Fires strictly after this instant are due; moves forward as
        // entries are enqueued.
        let mut horizon = Utc::now();

        loop {
            let next_fire = self
                .entries
                .iter()
                .filter_map(|entry| entry.schedule.after(&horizon).next())
                .min();
            let Some(next_fire) = next_fire else {
                tracing::warn!("no future fires for any schedule entry; scheduler exiting");
                return;
            };

            if !self.sleep_until(next_fire).await {
                tracing::info!("scheduler stopped");
                return;
            }

            let now = Utc::now();
            for entry in &self.entries {
                for fire in entry.schedule.after(&horizon) {
                    if fire > now {
                        break;
                    }
                    let info = self
                        .client
                        .enqueue(entry.kind.clone(), serde_json::Value::Null, entry.options.clone())
                        .await;
                    match info {
                        Ok(_) => {
                            tracing::debug!(kind = %entry.kind, fire = %fire, "periodic task enqueued");
                        }
                        Err(Error::ShuttingDown) => return,
                        Err(e) => {
                            tracing::error!(kind = %entry.kind, "periodic enqueue failed: {e}");
                        }
                    }
                }
            }
            horizon = now;
        }
    }

    /// Sleep until `when` or cancellation; false means cancelled.
    async fn sleep_until(&self, when: DateTime<Utc>) -> bool {
        let delay = (when - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

fn parse_spec(spec: &str) -> Result<Schedule> {
    let fields = spec.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Job(format!("invalid cron spec '{spec}': {e}")))
}
