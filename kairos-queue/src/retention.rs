//! Retention of finished jobs.
//!
//! Age limits are read from each job's own policy, so per-job overrides
//! apply. Count limits are a property of the whole state bucket and come
//! from the queue configuration.

use crate::error::QueueResult;
use crate::events::QueueEvent;
use crate::job::{Job, JobId, JobState};
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Limits for one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionPolicy {
    /// Evict jobs finished longer ago than this
    #[serde(default, with = "crate::duration::option_secs")]
    pub age: Option<Duration>,

    /// Keep at most this many of the newest jobs
    #[serde(default)]
    pub count: Option<usize>,
}

impl RetentionPolicy {
    /// Keep everything.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// Evict after `age`.
    pub fn max_age(age: Duration) -> Self {
        Self {
            age: Some(age),
            count: None,
        }
    }

    /// Keep only the newest `count`.
    pub fn max_count(count: usize) -> Self {
        Self {
            age: None,
            count: Some(count),
        }
    }

    /// Add a count limit.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    fn is_expired(&self, finished_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.age {
            Some(age) => now - finished_at > crate::duration::to_chrono(age),
            None => false,
        }
    }
}

/// Retention for completed and failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Policy for completed jobs
    pub completed: RetentionPolicy,

    /// Policy for failed jobs
    pub failed: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed: RetentionPolicy::max_age(Duration::from_secs(24 * 3600)).with_count(1000),
            failed: RetentionPolicy::max_age(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

impl RetentionConfig {
    /// Keep every finished job.
    pub fn keep_all() -> Self {
        Self {
            completed: RetentionPolicy::keep_all(),
            failed: RetentionPolicy::keep_all(),
        }
    }

    /// Policy for a terminal state.
    pub fn policy_for(&self, state: JobState) -> Option<&RetentionPolicy> {
        match state {
            JobState::Completed => Some(&self.completed),
            JobState::Failed => Some(&self.failed),
            _ => None,
        }
    }
}

fn finished_at(job: &Job) -> DateTime<Utc> {
    job.finished_at.unwrap_or(job.created_at)
}

/// Pick the jobs of one terminal state that must be evicted.
pub fn select_evictions(
    jobs: &[Job],
    state: JobState,
    queue_retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    let mut finished: Vec<&Job> = jobs.iter().filter(|job| job.state == state).collect();
    // newest first; ids break ties by creation order
    finished.sort_by(|a, b| finished_at(b).cmp(&finished_at(a)).then(b.id.cmp(&a.id)));

    let keep = queue_retention
        .policy_for(state)
        .and_then(|policy| policy.count)
        .unwrap_or(usize::MAX);

    finished
        .into_iter()
        .enumerate()
        .filter(|(rank, job)| {
            let expired = job
                .retention
                .policy_for(state)
                .is_some_and(|policy| policy.is_expired(finished_at(job), now));
            expired || *rank >= keep
        })
        .map(|(_, job)| job.id)
        .collect()
}

/// Evict finished jobs beyond their retention and announce each removal.
pub(crate) async fn sweep(queue: &Queue, now: DateTime<Utc>) -> QueueResult<usize> {
    let store = queue.store();
    let mut evicted = 0;

    for state in [JobState::Completed, JobState::Failed] {
        let jobs = store.list_jobs(&[state]).await?;
        let victims = select_evictions(&jobs, state, &queue.config().retention, now);

        for id in victims {
            if store.remove_job(id).await? {
                debug!(job_id = %id, state = %state, "Evicted finished job");
                queue.emit(QueueEvent::Removed { job_id: id }).await;
                evicted += 1;
            }
        }
    }

    if evicted > 0 {
        info!(queue = %queue.name(), evicted = evicted, "Retention sweep finished");
    }
    Ok(evicted)
}
