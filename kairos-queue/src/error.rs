//! Error types for queue operations.

use crate::job::{JobId, JobState};
use kairos_cron::CronError;
use kairos_ratelimit::RateLimitError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Timing options are invalid, ambiguous, or in the past
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No handler registered for the job name (never retried)
    #[error("No handler registered for job name: {0}")]
    UnknownHandler(String),

    /// Handler reported a failure; retried until attempts run out
    #[error("Job execution failed: {0}")]
    Execution(String),

    /// Handler reported a failure that must not be retried
    #[error("Unrecoverable job failure: {0}")]
    Unrecoverable(String),

    /// The backing store could not be reached or rejected the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The lease on an active job was lost before its outcome was recorded
    #[error("Lease expired for job {0}")]
    LeaseExpired(JobId),

    /// Illegal lifecycle transition
    #[error("Invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    /// A recurring series with the same key is already registered
    #[error("Recurring series already registered: {0}")]
    DuplicateSeries(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Scheduler not running
    #[error("Scheduler not running")]
    SchedulerNotRunning,

    /// Scheduler already running
    #[error("Scheduler already running")]
    SchedulerAlreadyRunning,

    /// Cron evaluation error
    #[error(transparent)]
    Cron(#[from] CronError),

    /// Rate limiter error
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl QueueError {
    /// Create a retryable execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a non-retryable execution error.
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    /// Whether a handler returning this error should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownHandler(_)
                | Self::Unrecoverable(_)
                | Self::InvalidSchedule(_)
                | Self::Config(_)
        )
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
