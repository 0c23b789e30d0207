//! Background job runtime.
//!
//! Typed tasks flow from a [`JobClient`] through a [`QueueStore`] to the
//! [`JobRuntime`]'s workers, which dispatch to registered handlers with
//! bounded concurrency, per-task timeouts, retry with exponential backoff,
//! and a dead-letter store once the retry budget is exhausted. A
//! [`Scheduler`] enqueues tasks on cron specs with minute resolution.
//!
//! Delivery is at-least-once: handlers must be idempotent. Enqueueing the
//! same logical work twice is only deduplicated when the caller supplies a
//! deduplication key.
//!
//! # Example
//!
//! ```rust,ignore
//! use buffkit::jobs::{EnqueueOptions, JobError, JobRuntime, MemoryQueue};
//!
//! let runtime = JobRuntime::new(Arc::new(MemoryQueue::new()), config.jobs.clone());
//! runtime.register_fn("mail:welcome", |ctx, task| async move {
//!     let email: String = serde_json::from_value(task.payload)
//!         .map_err(|e| JobError::fatal(e.to_string()))?;
//!     send_welcome(&email).await.map_err(|e| JobError::failed(e.to_string()))
//! });
//! runtime.start(4);
//!
//! let client = runtime.client();
//! client.enqueue("mail:welcome", serde_json::json!("a@x.test"), EnqueueOptions::default()).await?;
//! ```

mod queue;
mod runtime;
mod scheduler;
mod task;

pub use queue::{MemoryQueue, QueueStore};
pub use runtime::{JobClient, JobContext, JobError, JobRuntime};
pub use scheduler::Scheduler;
pub use task::{DeadTask, EnqueueOptions, QueueStats, Task, TaskInfo};

pub use crate::config::JobsConfig;
