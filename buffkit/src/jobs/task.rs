//! Task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Generated id
    pub id: String,
    /// Handler selector
    pub kind: String,
    /// JSON payload handed to the handler
    pub payload: serde_json::Value,
    /// Queue (priority class) the task lives on
    pub queue: String,
    /// Additional attempts allowed beyond the first
    pub retry_budget: u32,
    /// Per-attempt execution deadline
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Earliest execution time; `None` runs as soon as a worker is free
    pub run_at: Option<DateTime<Utc>>,
    /// Host-supplied idempotency key
    pub dedup_key: Option<String>,
    /// Completed attempts so far
    pub attempt: u32,
    /// Error from the most recent attempt
    pub last_error: Option<String>,
    /// When the task was first enqueued
    pub enqueued_at: DateTime<Utc>,
}

/// Options accepted at enqueue time. Unset fields fall back to the
/// runtime's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Target queue; defaults to `"default"`
    pub queue: Option<String>,
    /// Retry budget override
    pub retry_budget: Option<u32>,
    /// Timeout override
    pub timeout: Option<Duration>,
    /// Run after a delay from now
    pub delay: Option<Duration>,
    /// Run at a specific time (wins over `delay`)
    pub run_at: Option<DateTime<Utc>>,
    /// Deduplication key; a second enqueue with the same key is a no-op
    pub dedup_key: Option<String>,
}

impl EnqueueOptions {
    /// Target a queue.
    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn retries(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay execution.
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set a deduplication key.
    #[must_use]
    pub fn dedup(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// What the caller gets back from enqueue.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Generated id ("" when a dedup key suppressed the enqueue)
    pub id: String,
    /// Task kind
    pub kind: String,
    /// Queue it landed on
    pub queue: String,
    /// Scheduled time, when delayed
    pub run_at: Option<DateTime<Utc>>,
    /// False when a deduplication key suppressed this enqueue
    pub enqueued: bool,
}

/// A task that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadTask {
    /// The task as of its final attempt
    pub task: Task,
    /// The final error
    pub error: String,
    /// When it was dead-lettered
    pub died_at: DateTime<Utc>,
}

/// Counters for the stats command.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Ready tasks per queue
    pub pending: HashMap<String, usize>,
    /// Tasks waiting on a run-at time
    pub scheduled: usize,
    /// Completions per queue since startup
    pub completed: HashMap<String, u64>,
    /// Dead-letter count
    pub dead: usize,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = EnqueueOptions::default()
            .on_queue("critical")
            .retries(7)
            .timeout(Duration::from_secs(5))
            .dedup("once");
        assert_eq!(options.queue.as_deref(), Some("critical"));
        assert_eq!(options.retry_budget, Some(7));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.dedup_key.as_deref(), Some("once"));
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task {
            id: "t1".into(),
            kind: "mail:welcome".into(),
            payload: serde_json::json!({"to": "a@x.test"}),
            queue: "default".into(),
            retry_budget: 3,
            timeout: Duration::from_secs(30),
            run_at: None,
            dedup_key: None,
            attempt: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "mail:welcome");
        assert_eq!(back.timeout, Duration::from_secs(30));
    }
}
