//! Store adapter: the atomic primitives the queue is built on.
//!
//! Every method is one atomic step against the backing store. Workers in
//! different processes coordinate only through these operations.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobState};
use crate::schedule::RepeatSeries;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Proof of ownership of an active job, issued fresh on every claim.
pub type LeaseToken = Uuid;

/// A job taken off the ready list together with its lease.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The job, already marked `active`
    pub job: Job,
    /// Token for renewing and releasing the lease
    pub token: LeaseToken,
}

/// Store backend trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create or replace a job record.
    async fn write_job(&self, job: &Job) -> QueueResult<()>;

    /// Read a job record.
    async fn read_job(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Snapshot of jobs in the given states, grouped in the order the states
    /// are given and sorted by `run_at` (then creation) within each state.
    async fn list_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>>;

    /// Delete a job with its timer, ready entry and lease.
    async fn remove_job(&self, id: JobId) -> QueueResult<bool>;

    /// Persist a new job and arm it in the same step: a timer if it is
    /// `delayed`, the ready list if it is `waiting`.
    async fn add_job(&self, job: &Job) -> QueueResult<()>;

    /// Move up to `limit` timers due at `now` onto the ready list, oldest
    /// first, switching their jobs from `delayed` to `waiting`.
    async fn promote_due_timers(&self, now: DateTime<Utc>, limit: usize)
    -> QueueResult<Vec<JobId>>;

    /// Pop the next ready job, lease it for `lease` and mark it active.
    async fn claim_next(&self, lease: Duration) -> QueueResult<Option<Claim>>;

    /// Extend a lease. `false` if the token no longer owns the job.
    async fn renew_lease(&self, id: JobId, token: LeaseToken, lease: Duration)
    -> QueueResult<bool>;

    /// End a lease and persist the attempt outcome in the same step,
    /// arming a retry timer if `rearm_at` is set.
    ///
    /// `false` (nothing written) if the token no longer owns the job.
    async fn release_lease(
        &self,
        job: &Job,
        token: LeaseToken,
        rearm_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool>;

    /// Leases expired at `now` with their tokens, earliest expiry first.
    /// Nothing is changed.
    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<(JobId, LeaseToken)>>;

    /// Take back an expired lease. When `recovered` is given and the job
    /// still exists, the record is replaced in the same step and a
    /// `waiting` job goes back on the ready list.
    ///
    /// `false` (nothing written) if the token no longer owns the job or the
    /// lease was renewed past `now`.
    async fn reclaim_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        now: DateTime<Utc>,
        recovered: Option<&Job>,
    ) -> QueueResult<bool>;

    /// Register a series together with its first instance, which is added
    /// as by [`add_job`](Self::add_job). `false` (nothing written) if the
    /// key is taken.
    async fn add_series(&self, series: &RepeatSeries, first: &Job) -> QueueResult<bool>;

    /// Replace a series and add its next instance in one step, provided the
    /// stored series still exists and has produced `expected_produced`
    /// instances. `false` (nothing written) otherwise.
    async fn advance_series(
        &self,
        series: &RepeatSeries,
        expected_produced: u32,
        next: &Job,
    ) -> QueueResult<bool>;

    /// Read a series.
    async fn get_series(&self, key: &str) -> QueueResult<Option<RepeatSeries>>;

    /// Delete a series.
    async fn remove_series(&self, key: &str) -> QueueResult<bool>;

    /// All registered series.
    async fn list_series(&self) -> QueueResult<Vec<RepeatSeries>>;

    /// Get store type name.
    fn store_type(&self) -> &'static str;
}

/// Milliseconds since the epoch, used as sorted-set scores.
pub(crate) fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}
