//! In-memory store
//!
//! Single-process backend for tests and embedded use. One mutex guards all
//! structures, which makes every operation atomic.

use super::{Claim, JobStore, LeaseToken};
use crate::duration::to_chrono;
use crate::error::QueueResult;
use crate::job::{Job, JobId, JobState};
use crate::schedule::RepeatSeries;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LeaseToken,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Timers ordered by due time, then creation order
    timers: BTreeSet<(DateTime<Utc>, JobId)>,
    timer_index: HashMap<JobId, DateTime<Utc>>,
    ready: VecDeque<JobId>,
    leases: HashMap<JobId, Lease>,
    series: HashMap<String, RepeatSeries>,
}

impl Inner {
    fn clear_timer(&mut self, id: JobId) {
        if let Some(at) = self.timer_index.remove(&id) {
            self.timers.remove(&(at, id));
        }
    }

    fn arm_timer(&mut self, id: JobId, at: DateTime<Utc>) {
        self.clear_timer(id);
        self.timers.insert((at, id));
        self.timer_index.insert(id, at);
    }

    fn add_job(&mut self, job: &Job) {
        self.jobs.insert(job.id, job.clone());
        if job.state == JobState::Delayed {
            self.arm_timer(job.id, job.run_at);
        } else {
            self.ready.push_back(job.id);
        }
    }
}

/// In-memory job store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Whether the store holds no jobs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of armed timers
    pub fn timer_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Number of entries on the ready list
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn write_job(&self, job: &Job) -> QueueResult<()> {
        self.inner.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn read_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<(usize, Job)> = inner
            .jobs
            .values()
            .filter_map(|job| {
                states
                    .iter()
                    .position(|state| *state == job.state)
                    .map(|rank| (rank, job.clone()))
            })
            .collect();

        jobs.sort_by(|(ra, a), (rb, b)| ra.cmp(rb).then(a.run_at.cmp(&b.run_at)).then(a.id.cmp(&b.id)));
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    async fn remove_job(&self, id: JobId) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.jobs.remove(&id).is_some();
        inner.clear_timer(id);
        inner.ready.retain(|ready| *ready != id);
        inner.leases.remove(&id);
        Ok(existed)
    }

    async fn add_job(&self, job: &Job) -> QueueResult<()> {
        self.inner.lock().add_job(job);
        Ok(())
    }

    async fn promote_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        let mut inner = self.inner.lock();
        let mut promoted = Vec::new();

        while promoted.len() < limit {
            let Some(&(at, id)) = inner.timers.first() else {
                break;
            };
            if at > now {
                break;
            }
            inner.timers.remove(&(at, id));
            inner.timer_index.remove(&id);

            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if job.state == JobState::Delayed {
                job.state = JobState::Waiting;
            }
            inner.ready.push_back(id);
            promoted.push(id);
        }

        if !promoted.is_empty() {
            trace!(count = promoted.len(), "Promoted due timers");
        }
        Ok(promoted)
    }

    async fn claim_next(&self, lease: Duration) -> QueueResult<Option<Claim>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        while let Some(id) = inner.ready.pop_front() {
            if inner.leases.contains_key(&id) {
                continue;
            }
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            // stale ready entries of finished or re-armed jobs are dropped
            if job.mark_active(now).is_err() {
                continue;
            }

            let claimed = job.clone();
            let token = Uuid::new_v4();
            inner.leases.insert(
                id,
                Lease {
                    token,
                    expires_at: now + to_chrono(lease),
                },
            );
            return Ok(Some(Claim {
                job: claimed,
                token,
            }));
        }

        Ok(None)
    }

    async fn renew_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        lease: Duration,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&id) {
            Some(current) if current.token == token => {
                current.expires_at = Utc::now() + to_chrono(lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(
        &self,
        job: &Job,
        token: LeaseToken,
        rearm_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        match inner.leases.get(&job.id) {
            Some(current) if current.token == token => {}
            _ => return Ok(false),
        }

        inner.leases.remove(&job.id);
        inner.jobs.insert(job.id, job.clone());
        if let Some(at) = rearm_at {
            inner.arm_timer(job.id, at);
        }
        Ok(true)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<(JobId, LeaseToken)>> {
        let inner = self.inner.lock();
        let mut expired: Vec<(DateTime<Utc>, JobId, LeaseToken)> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, lease)| (lease.expires_at, *id, lease.token))
            .collect();
        expired.sort();
        Ok(expired.into_iter().map(|(_, id, token)| (id, token)).collect())
    }

    async fn reclaim_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        now: DateTime<Utc>,
        recovered: Option<&Job>,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        match inner.leases.get(&id) {
            Some(current) if current.token == token && current.expires_at <= now => {}
            _ => return Ok(false),
        }

        inner.leases.remove(&id);
        if let Some(job) = recovered
            && inner.jobs.contains_key(&id)
        {
            inner.jobs.insert(id, job.clone());
            if job.state == JobState::Waiting {
                inner.ready.push_back(id);
            }
        }
        Ok(true)
    }

    async fn add_series(&self, series: &RepeatSeries, first: &Job) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        if inner.series.contains_key(&series.key) {
            return Ok(false);
        }
        inner.series.insert(series.key.clone(), series.clone());
        inner.add_job(first);
        Ok(true)
    }

    async fn advance_series(
        &self,
        series: &RepeatSeries,
        expected_produced: u32,
        next: &Job,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.lock();
        match inner.series.get_mut(&series.key) {
            Some(current) if current.produced == expected_produced => *current = series.clone(),
            _ => return Ok(false),
        }
        inner.add_job(next);
        Ok(true)
    }

    async fn get_series(&self, key: &str) -> QueueResult<Option<RepeatSeries>> {
        Ok(self.inner.lock().series.get(key).cloned())
    }

    async fn remove_series(&self, key: &str) -> QueueResult<bool> {
        Ok(self.inner.lock().series.remove(key).is_some())
    }

    async fn list_series(&self) -> QueueResult<Vec<RepeatSeries>> {
        let inner = self.inner.lock();
        let mut series: Vec<RepeatSeries> = inner.series.values().cloned().collect();
        series.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(series)
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delayed(seconds_from_now: i64) -> Job {
        Job::new("t", json!({})).delayed_until(Utc::now() + chrono::Duration::seconds(seconds_from_now))
    }

    async fn store_with(jobs: &[Job]) -> MemoryStore {
        let store = MemoryStore::new();
        for job in jobs {
            store.add_job(job).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_promote_only_due_timers() {
        let due = delayed(-1);
        let later = delayed(60);
        let store = store_with(&[due.clone(), later.clone()]).await;

        let promoted = store.promote_due_timers(Utc::now(), 100).await.unwrap();
        assert_eq!(promoted, vec![due.id]);
        assert_eq!(store.timer_count(), 1);

        let job = store.read_job(due.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        let untouched = store.read_job(later.id).await.unwrap().unwrap();
        assert_eq!(untouched.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn test_promotion_respects_batch_and_order() {
        let at = Utc::now() - chrono::Duration::seconds(5);
        let jobs: Vec<Job> = (0..5).map(|_| Job::new("t", json!({})).delayed_until(at)).collect();
        let store = store_with(&jobs).await;

        let first = store.promote_due_timers(Utc::now(), 3).await.unwrap();
        let rest = store.promote_due_timers(Utc::now(), 3).await.unwrap();

        let all: Vec<JobId> = first.into_iter().chain(rest).collect();
        let expected: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let job = Job::new("t", json!({}));
        let store = store_with(&[job.clone()]).await;

        let claim = store.claim_next(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(claim.job.id, job.id);
        assert_eq!(claim.job.state, JobState::Active);
        assert!(claim.job.processed_at.is_some());

        // a duplicate ready entry must not hand out a second lease
        store.inner.lock().ready.push_back(job.id);
        assert!(store.claim_next(Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_requires_current_token() {
        let job = Job::new("t", json!({}));
        let store = store_with(&[job]).await;
        let Claim { mut job, token } = store.claim_next(Duration::from_secs(30)).await.unwrap().unwrap();

        job.mark_completed(json!("ok"), Utc::now()).unwrap();
        assert!(!store.release_lease(&job, Uuid::new_v4(), None).await.unwrap());
        assert!(store.release_lease(&job, token, None).await.unwrap());
        assert!(!store.release_lease(&job, token, None).await.unwrap());

        let stored = store.read_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_release_with_rearm_arms_timer() {
        let store = store_with(&[Job::new("t", json!({}))]).await;
        let Claim { mut job, token } = store.claim_next(Duration::from_secs(30)).await.unwrap().unwrap();

        job.mark_retrying("boom", Utc::now()).unwrap();
        assert!(store.release_lease(&job, token, Some(job.run_at)).await.unwrap());
        assert_eq!(store.timer_count(), 1);

        let promoted = store
            .promote_due_timers(job.run_at + chrono::Duration::milliseconds(1), 10)
            .await
            .unwrap();
        assert_eq!(promoted, vec![job.id]);
    }

    #[tokio::test]
    async fn test_expired_leases_are_listed_not_dropped() {
        let store = store_with(&[Job::new("t", json!({}))]).await;
        let claim = store.claim_next(Duration::from_millis(10)).await.unwrap().unwrap();

        assert!(store.expired_leases(Utc::now() - chrono::Duration::seconds(1)).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(1);
        let expired = store.expired_leases(later).await.unwrap();
        assert_eq!(expired, vec![(claim.job.id, claim.token)]);
        // listing twice sees the same lease until it is reclaimed
        assert_eq!(store.expired_leases(later).await.unwrap(), expired);
        assert!(store.renew_lease(claim.job.id, claim.token, Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_requeues_and_ends_lease() {
        let store = store_with(&[Job::new("t", json!({}))]).await;
        let Claim { mut job, token } = store.claim_next(Duration::from_millis(10)).await.unwrap().unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);

        assert!(job.mark_stalled(later).unwrap());
        assert!(!store.reclaim_lease(job.id, Uuid::new_v4(), later, Some(&job)).await.unwrap());
        // not expired yet at claim time
        assert!(!store.reclaim_lease(job.id, token, Utc::now() - chrono::Duration::seconds(1), Some(&job)).await.unwrap());

        assert!(store.reclaim_lease(job.id, token, later, Some(&job)).await.unwrap());
        assert!(!store.reclaim_lease(job.id, token, later, Some(&job)).await.unwrap());
        assert!(!store.renew_lease(job.id, token, Duration::from_secs(1)).await.unwrap());

        let stored = store.read_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(store.ready_len(), 1);
        assert!(store.claim_next(Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reclaim_without_record_only_drops_lease() {
        let store = store_with(&[Job::new("t", json!({}))]).await;
        let claim = store.claim_next(Duration::from_millis(10)).await.unwrap().unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);

        assert!(store.reclaim_lease(claim.job.id, claim.token, later, None).await.unwrap());
        assert!(store.expired_leases(later).await.unwrap().is_empty());
        assert_eq!(store.ready_len(), 0);
        let stored = store.read_job(claim.job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
    }

    fn series(key: &str, produced: u32) -> RepeatSeries {
        RepeatSeries {
            key: key.into(),
            name: "t".into(),
            payload: json!({}),
            recurrence: crate::schedule::Recurrence::Interval {
                every: Duration::from_secs(60),
                limit: None,
            },
            max_attempts: 1,
            backoff: Default::default(),
            retention: Default::default(),
            produced,
            latest_run_at: Utc::now(),
            latest_job: Uuid::nil(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_series_is_all_or_nothing() {
        let store = MemoryStore::new();
        let first = delayed(60);
        assert!(store.add_series(&series("k", 1), &first).await.unwrap());
        assert_eq!(store.timer_count(), 1);

        let other = delayed(60);
        assert!(!store.add_series(&series("k", 1), &other).await.unwrap());
        assert!(store.read_job(other.id).await.unwrap().is_none());
        assert_eq!(store.timer_count(), 1);
    }

    #[tokio::test]
    async fn test_advance_series_compares_produced() {
        let store = MemoryStore::new();
        store.add_series(&series("k", 1), &delayed(60)).await.unwrap();

        let second = delayed(120);
        assert!(store.advance_series(&series("k", 2), 1, &second).await.unwrap());
        assert_eq!(store.timer_count(), 2);

        // a second caller racing on the same occurrence writes nothing
        let fork = delayed(120);
        assert!(!store.advance_series(&series("k", 2), 1, &fork).await.unwrap());
        assert!(store.read_job(fork.id).await.unwrap().is_none());

        store.remove_series("k").await.unwrap();
        let orphan = delayed(180);
        assert!(!store.advance_series(&series("k", 3), 2, &orphan).await.unwrap());
        assert_eq!(store.get_series("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_job_clears_everything() {
        let job = delayed(60);
        let store = store_with(&[job.clone()]).await;

        assert!(store.remove_job(job.id).await.unwrap());
        assert!(!store.remove_job(job.id).await.unwrap());
        assert!(store.is_empty());
        assert_eq!(store.timer_count(), 0);
    }

    #[tokio::test]
    async fn test_list_jobs_grouped_and_sorted() {
        let late = delayed(20);
        let early = delayed(10);
        let ready = Job::new("t", json!({}));
        let store = store_with(&[late.clone(), early.clone(), ready.clone()]).await;

        let listed: Vec<JobId> = store
            .list_jobs(&[JobState::Waiting, JobState::Delayed])
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(listed, vec![ready.id, early.id, late.id]);
    }
}
