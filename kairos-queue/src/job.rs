//! Job record and lifecycle state machine.
//!
//! ```text
//! delayed ──(scheduler)──▶ waiting ──(claim)──▶ active ──▶ completed
//!    ▲                        ▲                   │
//!    └──────(retry wait)──────┼───────────────────┤
//!                             └───(stalled)───────┼──▶ failed
//! ```

use crate::backoff::BackoffPolicy;
use crate::duration::to_chrono;
use crate::error::{QueueError, QueueResult};
use crate::retention::RetentionConfig;
use crate::schedule::Recurrence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Job unique identifier (UUIDv7, so ids sort in creation order).
pub type JobId = Uuid;

/// Job data payload.
pub type JobData = serde_json::Value;

/// Default retry ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Reason recorded when a job is failed by stall recovery.
pub const LEASE_EXPIRED_REASON: &str = "lease expired";

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed by a worker
    Waiting,
    /// Waiting for its `run_at` (first run or retry)
    Delayed,
    /// Leased by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Failed permanently
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Lowercase name used in store keys and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::Deserialization(format!("unknown job state: {}", s)))
    }
}

/// Link from a job instance to the recurring series that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatInfo {
    /// Series key
    pub key: String,

    /// 1-based occurrence number of this instance
    pub occurrence: u32,

    /// Recurrence rule of the series
    pub recurrence: Recurrence,
}

/// What a failed attempt led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Re-armed for another attempt after `delay`
    Retry {
        delay: Duration,
        run_at: DateTime<Utc>,
    },
    /// Failed permanently
    Exhausted,
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Handler name
    pub name: String,

    /// Job payload data
    pub payload: JobData,

    /// Lifecycle state
    pub state: JobState,

    /// Failed attempts so far
    pub attempts_made: u32,

    /// Retry ceiling
    pub max_attempts: u32,

    /// Delay policy between attempts
    pub backoff: BackoffPolicy,

    /// Earliest dispatch time
    pub run_at: DateTime<Utc>,

    /// Series link for recurring instances
    #[serde(default)]
    pub repeat: Option<RepeatInfo>,

    /// Handler result (completed jobs)
    #[serde(default)]
    pub result: Option<JobData>,

    /// Last failure reason
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When a worker last claimed the job
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// How long the job is kept once finished
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Job {
    /// Create a waiting job that is eligible right away.
    pub fn new(name: impl Into<String>, payload: JobData) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            run_at: now,
            repeat: None,
            result: None,
            failure_reason: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            retention: RetentionConfig::default(),
        }
    }

    /// Set max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set retention policy.
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Attach to a recurring series.
    pub fn with_repeat(mut self, repeat: RepeatInfo) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Hold the job back until `run_at`.
    pub fn delayed_until(mut self, run_at: DateTime<Utc>) -> Self {
        self.state = JobState::Delayed;
        self.run_at = run_at;
        self
    }

    /// Check if the job can be retried after one more failure.
    pub fn can_retry(&self) -> bool {
        self.attempts_made.saturating_add(1) < self.max_attempts
    }

    fn ensure(&self, allowed: &[JobState], to: JobState) -> QueueResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to,
            })
        }
    }

    /// `delayed -> waiting`, done by the scheduler when the timer fires.
    pub fn mark_waiting(&mut self) -> QueueResult<()> {
        self.ensure(&[JobState::Delayed], JobState::Waiting)?;
        self.state = JobState::Waiting;
        Ok(())
    }

    /// `waiting -> active` on claim.
    pub fn mark_active(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobState::Waiting], JobState::Active)?;
        self.state = JobState::Active;
        self.processed_at = Some(now);
        Ok(())
    }

    /// `active -> completed`.
    pub fn mark_completed(&mut self, result: JobData, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobState::Active], JobState::Completed)?;
        self.state = JobState::Completed;
        self.result = Some(result);
        self.failure_reason = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// `active -> delayed`: count the failed attempt and re-arm after backoff.
    ///
    /// Fails with `InvalidTransition` when no attempts are left.
    pub fn mark_retrying(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> QueueResult<Duration> {
        self.ensure(&[JobState::Active], JobState::Delayed)?;
        if !self.can_retry() {
            return Err(QueueError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to: JobState::Delayed,
            });
        }

        self.attempts_made += 1;
        let delay = self.backoff.delay_for(self.attempts_made);
        self.state = JobState::Delayed;
        self.run_at = now + to_chrono(delay);
        self.failure_reason = Some(reason.into());
        Ok(delay)
    }

    /// `active -> failed`: count the attempt and stop for good.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobState::Active], JobState::Failed)?;
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts.max(1));
        self.state = JobState::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt, retrying when allowed and attempts remain.
    pub fn record_failure(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<AttemptOutcome> {
        if retryable && self.can_retry() {
            let delay = self.mark_retrying(reason, now)?;
            Ok(AttemptOutcome::Retry {
                delay,
                run_at: self.run_at,
            })
        } else {
            self.mark_failed(reason, now)?;
            Ok(AttemptOutcome::Exhausted)
        }
    }

    /// Lease of an active job expired: the attempt counts as failed.
    ///
    /// Returns `true` if the job went back to `waiting`, `false` if it failed.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) -> QueueResult<bool> {
        self.ensure(&[JobState::Active], JobState::Waiting)?;
        if self.can_retry() {
            self.attempts_made += 1;
            self.state = JobState::Waiting;
            self.failure_reason = Some(LEASE_EXPIRED_REASON.to_string());
            Ok(true)
        } else {
            self.mark_failed(LEASE_EXPIRED_REASON, now)?;
            Ok(false)
        }
    }
}
