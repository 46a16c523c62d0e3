//! # Kairos Queue
//!
//! Durable job queue and worker dispatch.
//!
//! ## Features
//!
//! - **Delayed Jobs** - Run after a delay or at a fixed time
//! - **Recurring Jobs** - Fixed intervals or cron expressions with timezones
//! - **Retry Logic** - Fixed or exponential backoff up to a retry ceiling
//! - **Worker Pools** - Bounded concurrency and sliding-window rate limits
//! - **Leases** - Crashed workers' jobs are recovered after their lease expires
//! - **Retention** - Finished jobs evicted by age and count
//! - **Events** - Lifecycle events in-process or over Redis pub/sub
//!
//! ## Quick Start
//!
//! ```no_run
//! use kairos_queue::*;
//! use std::time::Duration;
//!
//! # async fn example() -> QueueResult<()> {
//! let queue = Queue::connect(QueueConfig::new("redis://localhost:6379", "emails")).await?;
//!
//! // Send in five seconds
//! queue
//!     .enqueue(
//!         "send-email",
//!         serde_json::json!({ "to": "user@example.com" }),
//!         JobOptions::delay(Duration::from_secs(5)),
//!     )
//!     .await?;
//!
//! // Hourly digest
//! queue
//!     .enqueue(
//!         "digest",
//!         serde_json::json!({}),
//!         JobOptions::with_schedule(ScheduleSpec::cron("0 * * * *")),
//!     )
//!     .await?;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("send-email", |job: Job| async move {
//!     println!("Sending email to {}", job.payload["to"]);
//!     Ok(serde_json::json!({ "sent": true }))
//! });
//!
//! let mut scheduler = Scheduler::new(queue.clone());
//! scheduler.start().await?;
//!
//! let mut worker = Worker::new(queue, handlers)?;
//! worker.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod duration;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod worker;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use error::{QueueError, QueueResult};
pub use events::{BroadcastEventBus, EventBus, QueueEvent, RedisEventBus};
pub use job::{AttemptOutcome, Job, JobData, JobId, JobState, RepeatInfo};
pub use queue::{JobOptions, Queue, QueueConfig};
pub use retention::{RetentionConfig, RetentionPolicy};
pub use schedule::{Recurrence, RepeatRequest, RepeatSeries, ScheduleRequest, ScheduleSpec};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use settings::Settings;
pub use store::{Claim, JobStore, LeaseToken, MemoryStore, RedisStore};
pub use worker::{HandlerRegistry, JobHandler, RateLimit, Worker, WorkerConfig};
