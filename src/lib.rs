// Kairos - durable job queue and worker dispatch
//
// Re-exports the queue engine and, behind features, the cron and
// rate-limiting building blocks it is made of.

pub use kairos_queue::*;

#[cfg(feature = "cron")]
pub use kairos_cron;

#[cfg(feature = "ratelimit")]
pub use kairos_ratelimit;

pub mod prelude {
    pub use kairos_queue::{
        BackoffPolicy, HandlerRegistry, Job, JobOptions, JobState, Queue, QueueConfig, QueueError,
        QueueEvent, QueueResult, RetentionConfig, ScheduleSpec, Scheduler, Settings, Worker,
        WorkerConfig,
    };
}
