//! The job client and worker runtime.

use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::queue::QueueStore;
use super::task::{DeadTask, EnqueueOptions, QueueStats, Task, TaskInfo};
use crate::config::JobsConfig;
use crate::error::{Error, Result};

/// Why a handler attempt failed.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retryable failure; the task re-enters the queue with backoff
    #[error("{0}")]
    Failed(String),

    /// Non-retryable failure; the task dead-letters immediately
    #[error("fatal: {0}")]
    Fatal(String),

    /// The attempt exceeded the task timeout
    #[error("handler timed out")]
    Timeout,

    /// The handler panicked (recovered by the runtime)
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Retryable failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Non-retryable failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Per-attempt context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Task id
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Fires when the runtime is shutting down; handlers should stop
    /// promptly once it does
    pub cancellation: CancellationToken,
}

type HandlerFn =
    Arc<dyn Fn(JobContext, Task) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send + Sync>;

/// Enqueue-side handle, cheap to clone into handlers and HTTP state.
#[derive(Clone)]
pub struct JobClient {
    queue: Arc<dyn QueueStore>,
    config: JobsConfig,
    cancel: CancellationToken,
}

impl JobClient {
    /// Enqueue a task.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] once the runtime is stopping; store errors
    /// otherwise.
    pub async fn enqueue(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskInfo> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let run_at = options
            .run_at
            .or_else(|| options.delay.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()));
        let task = Task {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            queue: options.queue.unwrap_or_else(|| "default".to_string()),
            retry_budget: options.retry_budget.unwrap_or(self.config.retry_budget),
            timeout: options
                .timeout
                .unwrap_or(Duration::from_secs(self.config.task_timeout_secs)),
            run_at,
            dedup_key: options.dedup_key,
            attempt: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        };

        let info = TaskInfo {
            id: task.id.clone(),
            kind: task.kind.clone(),
            queue: task.queue.clone(),
            run_at: task.run_at,
            enqueued: false,
        };
        let enqueued = self.queue.push(task).await?;
        tracing::debug!(kind = %info.kind, queue = %info.queue, enqueued, "task enqueued");
        Ok(TaskInfo { enqueued, ..info })
    }

    /// Queue counters.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Dead-letter snapshot.
    pub async fn dead_letters(&self) -> Result<Vec<DeadTask>> {
        self.queue.dead_letters().await
    }
}

/// The worker runtime: registered handlers plus a bounded worker pool.
pub struct JobRuntime {
    queue: Arc<dyn QueueStore>,
    handlers: Arc<RwLock<HashMap<String, HandlerFn>>>,
    config: JobsConfig,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl JobRuntime {
    /// Create a runtime over a queue store. Workers start on
    /// [`start`](Self::start), not here.
    #[must_use]
    pub fn new(queue: Arc<dyn QueueStore>, config: JobsConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// An enqueue handle sharing this runtime's queue and lifecycle.
    #[must_use]
    pub fn client(&self) -> JobClient {
        JobClient {
            queue: self.queue.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Register an async closure as the handler for a kind. The latest
    /// registration for a kind wins.
    pub fn register_fn<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), JobError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, task| Box::pin(handler(ctx, task)));
        self.handlers
            .write()
            .expect("handler map poisoned")
            .insert(kind.into(), handler);
    }

    /// Start the dispatch loop and `count` workers (0 falls back to the
    /// configured default).
    ///
    /// The dispatcher is the only task popping the queue, so per-queue
    /// concurrency caps are enforced without races: a task counts against
    /// its queue from dispatch until its worker finishes.
    pub fn start(&self, count: usize) {
        let count = if count == 0 { self.config.workers } else { count };
        let in_flight: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Task>(1);
        let dispatch_rx = Arc::new(AsyncMutex::new(dispatch_rx));

        let mut workers = self.workers.lock().expect("worker list poisoned");
        workers.push(tokio::spawn(dispatch_loop(
            self.queue.clone(),
            self.config.clone(),
            self.cancel.clone(),
            in_flight.clone(),
            dispatch_tx,
        )));
        for index in 0..count {
            workers.push(tokio::spawn(worker_loop(
                index,
                self.queue.clone(),
                self.handlers.clone(),
                self.config.clone(),
                self.cancel.clone(),
                in_flight.clone(),
                dispatch_rx.clone(),
            )));
        }
        tracing::info!(workers = count, "job dispatcher and workers started");
    }

    /// Queue counters.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Stop accepting work and wait for in-flight handlers.
    ///
    /// Workers stop popping immediately; a handler already running gets
    /// the configured grace period before its worker is aborted.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let handles = {
            let mut workers = self.workers.lock().expect("worker list poisoned");
            std::mem::take(&mut *workers)
        };
        for mut handle in handles {
            if timeout(grace, &mut handle).await.is_err() {
                tracing::warn!("job worker exceeded shutdown grace; aborting");
                handle.abort();
            }
        }
        tracing::info!("job runtime shut down");
    }
}

/// Exponential backoff: `base * 2^(attempt-1)` capped at the configured
/// maximum, plus up to half that again in jitter.
fn backoff_delay(config: &JobsConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    let capped = raw.min(config.backoff_max_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped.saturating_add(jitter).min(config.backoff_max_ms.saturating_mul(2)))
}

/// Queues the dispatcher may pull from right now: the configured
/// priority list minus queues at their concurrency cap.
fn eligible_queues(config: &JobsConfig, in_flight: &Mutex<HashMap<String, usize>>) -> Vec<String> {
    let in_flight = in_flight.lock().expect("in-flight map poisoned");
    config
        .queues
        .iter()
        .filter(|queue| {
            config
                .queue_concurrency
                .get(*queue)
                .map(|cap| in_flight.get(*queue).copied().unwrap_or(0) < *cap)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// The dispatch loop: pop by priority, count the task against its queue,
/// hand it to a worker. Exits on cancellation; dropping the channel ends
/// the workers once they drain.
async fn dispatch_loop(
    queue: Arc<dyn QueueStore>,
    config: JobsConfig,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    dispatch_tx: mpsc::Sender<Task>,
) {
    tracing::debug!("job dispatcher running");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let eligible = eligible_queues(&config, &in_flight);
        if eligible.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }

        // Bounded pop so freed-up queue capacity is observed promptly; a
        // timed-out pop has not taken a task.
        let task = match timeout(Duration::from_millis(250), queue.pop(&eligible, &cancel)).await {
            Err(_elapsed) => continue,
            Ok(None) => break,
            Ok(Some(task)) => task,
        };

        *in_flight
            .lock()
            .expect("in-flight map poisoned")
            .entry(task.queue.clone())
            .or_default() += 1;

        if dispatch_tx.send(task).await.is_err() {
            break;
        }
    }
    tracing::debug!("job dispatcher exited");
}

async fn worker_loop(
    index: usize,
    queue: Arc<dyn QueueStore>,
    handlers: Arc<RwLock<HashMap<String, HandlerFn>>>,
    config: JobsConfig,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    dispatch_rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
) {
    tracing::debug!(worker = index, "job worker running");
    loop {
        // Hold the receiver lock only while waiting, never while running.
        let task = { dispatch_rx.lock().await.recv().await };
        let Some(task) = task else { break };
        let task_queue = task.queue.clone();

        let handler = handlers
            .read()
            .expect("handler map poisoned")
            .get(&task.kind)
            .cloned();

        match handler {
            Some(handler) => {
                run_one(&queue, &config, &cancel, handler, task).await;
            }
            None => {
                tracing::error!(kind = %task.kind, "no handler registered; dead-lettering");
                let error = format!("no handler registered for '{}'", task.kind);
                let mut dead = task;
                dead.attempt += 1;
                dead.last_error = Some(error.clone());
                let _ = queue
                    .dead_letter(DeadTask {
                        task: dead,
                        error,
                        died_at: Utc::now(),
                    })
                    .await;
            }
        }

        let mut in_flight = in_flight.lock().expect("in-flight map poisoned");
        if let Some(count) = in_flight.get_mut(&task_queue) {
            *count = count.saturating_sub(1);
        }
    }
    tracing::debug!(worker = index, "job worker exited");
}

async fn run_one(
    queue: &Arc<dyn QueueStore>,
    config: &JobsConfig,
    cancel: &CancellationToken,
    handler: HandlerFn,
    mut task: Task,
) {
    let attempt = task.attempt + 1;
    let ctx = JobContext {
        task_id: task.id.clone(),
        attempt,
        cancellation: cancel.child_token(),
    };

    // The handler runs in its own tokio task so a panic is contained and
    // surfaces as a retryable failure instead of killing the worker.
    let future = handler(ctx, task.clone());
    let mut handle = tokio::spawn(future);
    let task_timeout = task.timeout;

    let outcome: std::result::Result<(), JobError> = match timeout(task_timeout, &mut handle).await
    {
        Err(_elapsed) => {
            handle.abort();
            Err(JobError::Timeout)
        }
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(JobError::Panicked(panic_message(join_error)))
        }
        Ok(Err(_cancelled)) => Err(JobError::failed("handler task cancelled")),
        Ok(Ok(result)) => result,
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(kind = %task.kind, attempt, "task completed");
            if let Err(e) = queue.complete(&task).await {
                tracing::error!("failed to record completion: {e}");
            }
        }
        Err(error) => {
            task.attempt = attempt;
            let message = error.to_string();
            task.last_error = Some(message.clone());

            let exhausted = task.attempt > task.retry_budget;
            if error.is_fatal() || exhausted {
                tracing::warn!(
                    kind = %task.kind,
                    attempts = task.attempt,
                    "task failed permanently: {message}"
                );
                let _ = queue
                    .dead_letter(DeadTask {
                        task,
                        error: message,
                        died_at: Utc::now(),
                    })
                    .await;
            } else {
                let delay = backoff_delay(config, task.attempt);
                task.run_at = Some(
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                );
                tracing::debug!(
                    kind = %task.kind,
                    attempt = task.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "task failed; scheduling retry: {message}"
                );
                if let Err(e) = queue.push(task).await {
                    tracing::error!("failed to re-enqueue task for retry: {e}");
                }
            }
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    match join_error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryQueue;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use tokio::sync::Mutex as AsyncMutex;

    fn test_config() -> JobsConfig {
        JobsConfig {
            workers: 2,
            queues: vec!["critical".into(), "default".into(), "low".into()],
            queue_concurrency: HashMap::new(),
            retry_budget: 3,
            task_timeout_secs: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            shutdown_grace_secs: 2,
        }
    }

    fn runtime() -> JobRuntime {
        JobRuntime::new(Arc::new(MemoryQueue::new()), test_config())
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }

    async fn wait_for_dead_letters(client: &JobClient, n: usize, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if client.dead_letters().await.map(|d| d.len()).unwrap_or(0) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_dispatch_and_complete() {
        let runtime = runtime();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_handler = hits.clone();
        runtime.register_fn("count", move |_ctx, _task| {
            let hits = hits_in_handler.clone();
            async move {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        runtime.start(2);

        let client = runtime.client();
        for _ in 0..5 {
            client
                .enqueue("count", serde_json::Value::Null, EnqueueOptions::default())
                .await
                .unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(3), || hits
                .load(AtomicOrdering::SeqCst)
                == 5)
            .await
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_dead_letters() {
        let runtime = runtime();
        let invocations = Arc::new(AtomicU32::new(0));
        let attempt_times = Arc::new(AsyncMutex::new(Vec::<tokio::time::Instant>::new()));

        let counter = invocations.clone();
        let times = attempt_times.clone();
        runtime.register_fn("always-fails", move |_ctx, _task| {
            let counter = counter.clone();
            let times = times.clone();
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                times.lock().await.push(tokio::time::Instant::now());
                Err(JobError::failed("nope"))
            }
        });
        runtime.start(1);

        let client = runtime.client();
        client
            .enqueue(
                "always-fails",
                serde_json::Value::Null,
                EnqueueOptions::default().retries(3),
            )
            .await
            .unwrap();

        // Budget 3 means exactly 4 invocations and one dead letter.
        assert!(
            wait_until(Duration::from_secs(10), || invocations
                .load(AtomicOrdering::SeqCst)
                >= 4)
            .await
        );
        assert!(wait_for_dead_letters(&client, 1, Duration::from_secs(5)).await);
        assert_eq!(invocations.load(AtomicOrdering::SeqCst), 4);

        let dead = client.dead_letters().await.unwrap();
        assert_eq!(dead[0].task.attempt, 4);
        assert_eq!(dead[0].error, "nope");

        // Backoff spacing: at least base, 2x base, 4x base between attempts.
        let times = attempt_times.lock().await;
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[1] >= Duration::from_millis(20));
        assert!(gaps[2] >= Duration::from_millis(40));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries() {
        let runtime = runtime();
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        runtime.register_fn("fatal", move |_ctx, _task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Err(JobError::fatal("bad payload"))
            }
        });
        runtime.start(1);

        let client = runtime.client();
        client
            .enqueue("fatal", serde_json::Value::Null, EnqueueOptions::default())
            .await
            .unwrap();

        assert!(wait_for_dead_letters(&client, 1, Duration::from_secs(3)).await);
        assert_eq!(invocations.load(AtomicOrdering::SeqCst), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recovered() {
        let runtime = runtime();
        runtime.register_fn("explodes", |_ctx, _task| async move {
            panic!("boom");
        });
        runtime.start(1);

        let client = runtime.client();
        client
            .enqueue(
                "explodes",
                serde_json::Value::Null,
                EnqueueOptions::default().retries(0),
            )
            .await
            .unwrap();

        assert!(wait_for_dead_letters(&client, 1, Duration::from_secs(3)).await);
        let dead = client.dead_letters().await.unwrap();
        assert!(dead[0].error.contains("boom"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_follows_retry_path() {
        let runtime = runtime();
        runtime.register_fn("sleeps", |_ctx, _task| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        runtime.start(1);

        let client = runtime.client();
        client
            .enqueue(
                "sleeps",
                serde_json::Value::Null,
                EnqueueOptions::default()
                    .retries(0)
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(wait_for_dead_letters(&client, 1, Duration::from_secs(3)).await);
        let dead = client.dead_letters().await.unwrap();
        assert!(dead[0].error.contains("timed out"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_dedup_key_single_invocation() {
        let runtime = runtime();
        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        runtime.register_fn("once", move |_ctx, _task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        runtime.start(1);

        let client = runtime.client();
        let first = client
            .enqueue(
                "once",
                serde_json::Value::Null,
                EnqueueOptions::default().dedup("job-42"),
            )
            .await
            .unwrap();
        let second = client
            .enqueue(
                "once",
                serde_json::Value::Null,
                EnqueueOptions::default().dedup("job-42"),
            )
            .await
            .unwrap();
        assert!(first.enqueued);
        assert!(!second.enqueued);

        assert!(
            wait_until(Duration::from_secs(3), || invocations
                .load(AtomicOrdering::SeqCst)
                == 1)
            .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(invocations.load(AtomicOrdering::SeqCst), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_queue_concurrency_cap() {
        let mut config = test_config();
        config.queue_concurrency.insert("default".to_string(), 1);
        let runtime = JobRuntime::new(Arc::new(MemoryQueue::new()), config);

        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (current_h, peak_h) = (current.clone(), peak.clone());
        runtime.register_fn("capped", move |_ctx, _task| {
            let current = current_h.clone();
            let peak = peak_h.clone();
            async move {
                let now = current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                peak.fetch_max(now, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        runtime.start(3);

        let client = runtime.client();
        for _ in 0..4 {
            client
                .enqueue("capped", serde_json::Value::Null, EnqueueOptions::default())
                .await
                .unwrap();
        }

        let done = {
            let mut done = false;
            for _ in 0..300 {
                let stats = client.stats().await.unwrap();
                if stats.completed.get("default").copied().unwrap_or(0) == 4 {
                    done = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            done
        };
        assert!(done, "all capped tasks should complete");
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 1, "cap of 1 respected");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails_fast() {
        let runtime = runtime();
        runtime.start(1);
        let client = runtime.client();
        runtime.shutdown().await;

        assert!(matches!(
            client
                .enqueue("x", serde_json::Value::Null, EnqueueOptions::default())
                .await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let runtime = runtime();
        runtime.start(2);
        runtime.shutdown().await;
        runtime.shutdown().await;
    }

    #[test]
    fn test_backoff_sequence() {
        let config = test_config();
        // Jitter only adds; the floor is the exponential sequence.
        for (attempt, floor) in [(1u32, 10u64), (2, 20), (3, 40), (4, 80)] {
            let delay = backoff_delay(&config, attempt);
            assert!(delay >= Duration::from_millis(floor), "attempt {attempt}");
        }
        // Capped at the configured max (plus at most 50% jitter).
        let delay = backoff_delay(&config, 30);
        assert!(delay <= Duration::from_millis(750));
    }
}
