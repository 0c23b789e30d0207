//! Queue storage.
//!
//! The default is the in-memory [`MemoryQueue`]; an external broker plugs
//! in behind the same [`QueueStore`] trait as an adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::task::{DeadTask, QueueStats, Task};
use crate::error::Result;

/// How long a waiting pop sleeps between re-checks when nothing is due.
/// A bound on wakeup latency for pushes that race the notify registration.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Queue persistence: ready queues, delayed tasks, dead letters, counters.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a task. Returns `false` when a deduplication key suppressed
    /// it (first enqueue only; retries bypass deduplication).
    async fn push(&self, task: Task) -> Result<bool>;

    /// Pop the next ready task, searching `queues` in priority order.
    /// Blocks until a task is available or `cancel` fires; `None` means
    /// cancelled.
    async fn pop(&self, queues: &[String], cancel: &CancellationToken) -> Option<Task>;

    /// Record a successful completion; the task is destroyed.
    async fn complete(&self, task: &Task) -> Result<()>;

    /// Move a task to the dead-letter store.
    async fn dead_letter(&self, dead: DeadTask) -> Result<()>;

    /// Snapshot of the dead-letter store.
    async fn dead_letters(&self) -> Result<Vec<DeadTask>>;

    /// Counters for the stats command.
    async fn stats(&self) -> Result<QueueStats>;
}

struct Scheduled {
    run_at: DateTime<Utc>,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.run_at.cmp(&other.run_at)
    }
}

#[derive(Default)]
struct Inner {
    ready: HashMap<String, VecDeque<Task>>,
    scheduled: BinaryHeap<Reverse<Scheduled>>,
    dedup: HashSet<String>,
    dead: Vec<DeadTask>,
    completed: HashMap<String, u64>,
}

impl Inner {
    /// Move tasks whose run-at has arrived onto their ready queues.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(next)) = self.scheduled.peek() {
            if next.run_at > now {
                break;
            }
            let Reverse(entry) = self.scheduled.pop().expect("peeked entry");
            self.ready
                .entry(entry.task.queue.clone())
                .or_default()
                .push_back(entry.task);
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduled.peek().map(|Reverse(entry)| entry.run_at)
    }

    fn pop_ready(&mut self, queues: &[String]) -> Option<Task> {
        for queue in queues {
            if let Some(task) = self.ready.get_mut(queue).and_then(VecDeque::pop_front) {
                return Some(task);
            }
        }
        // Queues outside the configured priority list drain last, in name
        // order for determinism.
        let mut extra: Vec<&String> = self
            .ready
            .iter()
            .filter(|(name, tasks)| !queues.contains(name) && !tasks.is_empty())
            .map(|(name, _)| name)
            .collect();
        extra.sort();
        let name = extra.first()?.to_string();
        self.ready.get_mut(&name).and_then(VecDeque::pop_front)
    }
}

/// In-memory [`QueueStore`]: FIFO within a queue, priority across queues,
/// a run-at heap for delayed tasks, and a dead-letter list.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn push(&self, task: Task) -> Result<bool> {
        {
            let mut inner = self.inner.lock().expect("queue poisoned");

            // Deduplication applies to first enqueues only; a retry
            // (attempt > 0) of the same task must always re-enter.
            if task.attempt == 0 {
                if let Some(key) = &task.dedup_key {
                    if !inner.dedup.insert(key.clone()) {
                        tracing::debug!(kind = %task.kind, "enqueue suppressed by dedup key");
                        return Ok(false);
                    }
                }
            }

            let now = Utc::now();
            match task.run_at {
                Some(run_at) if run_at > now => {
                    inner.scheduled.push(Reverse(Scheduled { run_at, task }));
                }
                _ => {
                    inner
                        .ready
                        .entry(task.queue.clone())
                        .or_default()
                        .push_back(task);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn pop(&self, queues: &[String], cancel: &CancellationToken) -> Option<Task> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let (task, next_due) = {
                let mut inner = self.inner.lock().expect("queue poisoned");
                inner.promote_due(Utc::now());
                (inner.pop_ready(queues), inner.next_due())
            };
            if let Some(task) = task {
                return Some(task);
            }

            let sleep_for = next_due
                .map(|due| {
                    (due - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(POP_POLL_INTERVAL)
                })
                .unwrap_or(POP_POLL_INTERVAL);

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = self.notify.notified() => {}
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn complete(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        *inner.completed.entry(task.queue.clone()).or_default() += 1;
        Ok(())
    }

    async fn dead_letter(&self, dead: DeadTask) -> Result<()> {
        tracing::warn!(
            kind = %dead.task.kind,
            attempts = dead.task.attempt,
            error = %dead.error,
            "task moved to dead letter store"
        );
        self.inner.lock().expect("queue poisoned").dead.push(dead);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadTask>> {
        Ok(self.inner.lock().expect("queue poisoned").dead.clone())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().expect("queue poisoned");
        Ok(QueueStats {
            pending: inner
                .ready
                .iter()
                .map(|(name, tasks)| (name.clone(), tasks.len()))
                .collect(),
            scheduled: inner.scheduled.len(),
            completed: inner.completed.clone(),
            dead: inner.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: &str, queue: &str) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            queue: queue.into(),
            retry_budget: 3,
            timeout: Duration::from_secs(30),
            run_at: None,
            dedup_key: None,
            attempt: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    fn queues() -> Vec<String> {
        vec!["critical".into(), "default".into(), "low".into()]
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.push(task("first", "default")).await.unwrap();
        queue.push(task("second", "default")).await.unwrap();

        assert_eq!(queue.pop(&queues(), &cancel).await.unwrap().kind, "first");
        assert_eq!(queue.pop(&queues(), &cancel).await.unwrap().kind, "second");
    }

    #[tokio::test]
    async fn test_priority_across_queues() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.push(task("lowly", "low")).await.unwrap();
        queue.push(task("urgent", "critical")).await.unwrap();

        assert_eq!(queue.pop(&queues(), &cancel).await.unwrap().kind, "urgent");
        assert_eq!(queue.pop(&queues(), &cancel).await.unwrap().kind, "lowly");
    }

    #[tokio::test]
    async fn test_delayed_task_not_popped_early() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let mut delayed = task("later", "default");
        delayed.run_at = Some(Utc::now() + chrono::Duration::milliseconds(80));
        queue.push(delayed).await.unwrap();

        let started = std::time::Instant::now();
        let popped = queue.pop(&queues(), &cancel).await.unwrap();
        assert_eq!(popped.kind, "later");
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_pop_cancelled_returns_none() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.pop(&queues(), &cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_dedup_suppresses_second_enqueue_but_not_retries() {
        let queue = MemoryQueue::new();
        let mut first = task("once", "default");
        first.dedup_key = Some("key-1".into());
        assert!(queue.push(first.clone()).await.unwrap());
        assert!(!queue.push(first.clone()).await.unwrap());

        // A retry of the same task re-enters regardless of the key.
        first.attempt = 1;
        assert!(queue.push(first).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_and_dead_letters() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.push(task("a", "default")).await.unwrap();
        queue.push(task("b", "low")).await.unwrap();

        let popped = queue.pop(&queues(), &cancel).await.unwrap();
        queue.complete(&popped).await.unwrap();
        queue
            .dead_letter(DeadTask {
                task: task("dead", "default"),
                error: "always fails".into(),
                died_at: Utc::now(),
            })
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed.get("default"), Some(&1));
        assert_eq!(stats.pending.get("low"), Some(&1));
        assert_eq!(stats.dead, 1);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead[0].error, "always fails");
    }

    #[tokio::test]
    async fn test_unlisted_queue_still_drains() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.push(task("stray", "host-made-this-up")).await.unwrap();
        assert_eq!(queue.pop(&queues(), &cancel).await.unwrap().kind, "stray");
    }
}
