//! Producer-facing queue API.

use crate::backoff::BackoffPolicy;
use crate::duration::millis_until;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, QueueEvent, RedisEventBus};
use crate::job::{DEFAULT_MAX_ATTEMPTS, Job, JobData, JobId, JobState, RepeatInfo};
use crate::retention::RetentionConfig;
use crate::schedule::{RepeatSeries, ScheduleSpec};
use crate::store::{JobStore, RedisStore};
use chrono::{DateTime, Utc};
use kairos_cron::Tz;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Queue name
    pub queue_name: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Retry ceiling for jobs that do not set one
    pub default_max_attempts: u32,

    /// Backoff for jobs that do not set one
    pub default_backoff: BackoffPolicy,

    /// Retention of finished jobs
    pub retention: RetentionConfig,

    /// Timezone of cron schedules that do not name one
    pub timezone: Tz,
}

impl QueueConfig {
    /// Create a new queue configuration.
    pub fn new(redis_url: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            redis_url: redis_url.into(),
            key_prefix: format!("kairos:queue:{}", queue_name),
            queue_name,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_backoff: BackoffPolicy::default(),
            retention: RetentionConfig::default(),
            timezone: Tz::UTC,
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default retry policy.
    pub fn with_default_retry(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.default_max_attempts = max_attempts;
        self.default_backoff = backoff;
        self
    }

    /// Set the retention of finished jobs.
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Set the default cron timezone.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Pub/sub channel of the queue's events.
    pub fn events_channel(&self) -> String {
        format!("{}:events", self.key_prefix)
    }

    fn validate(&self) -> QueueResult<()> {
        if self.default_max_attempts == 0 {
            return Err(QueueError::Config(
                "default max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-job options for [`Queue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// When the job runs
    pub schedule: ScheduleSpec,
    /// Retry ceiling override
    pub max_attempts: Option<u32>,
    /// Backoff override
    pub backoff: Option<BackoffPolicy>,
    /// Retention override
    pub retention: Option<RetentionConfig>,
}

impl JobOptions {
    /// Run as soon as a worker is free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run after `delay`.
    pub fn delay(delay: Duration) -> Self {
        Self::with_schedule(ScheduleSpec::Delay(delay))
    }

    /// Run at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::with_schedule(ScheduleSpec::At(at))
    }

    /// Run on `schedule`.
    pub fn with_schedule(schedule: ScheduleSpec) -> Self {
        Self {
            schedule,
            ..Self::default()
        }
    }

    /// Override the retry ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the backoff.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override retention.
    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// Job queue over a [`JobStore`] and an [`EventBus`].
///
/// Cheap to clone; clones share the store and the bus.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventBus>,
    config: Arc<QueueConfig>,
}

impl Queue {
    /// Create a queue over explicit collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<dyn EventBus>,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        config.validate()?;
        info!(
            queue = %config.queue_name,
            store = store.store_type(),
            "Job queue ready"
        );
        Ok(Self {
            store,
            events,
            config: Arc::new(config),
        })
    }

    /// Connect a Redis-backed queue with events on the Redis channel.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        info!(queue = %config.queue_name, "Initializing job queue");
        debug!(prefix = %config.key_prefix, "Queue key prefix");

        let store = RedisStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
        let events = RedisEventBus::connect(&config.redis_url, config.events_channel()).await?;
        Self::new(Arc::new(store), Arc::new(events), config)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.config.queue_name
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Publish an event. Delivery failures are logged, never returned.
    pub(crate) async fn emit(&self, event: QueueEvent) {
        if let Err(e) = self.events.publish(event.clone()).await {
            warn!(
                queue = %self.config.queue_name,
                event = event.kind(),
                job_id = %event.job_id(),
                error = %e,
                "Failed to publish event"
            );
        }
    }

    /// Enqueue a job.
    ///
    /// # Errors
    ///
    /// `InvalidSchedule` for a bad or past schedule, `DuplicateSeries` if
    /// the recurring series is already registered, `StoreUnavailable` if
    /// the store fails.
    pub async fn enqueue(
        &self,
        name: impl Into<String>,
        payload: JobData,
        options: JobOptions,
    ) -> QueueResult<Job> {
        let name = name.into();
        let max_attempts = options.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be at least 1".into()));
        }

        let now = Utc::now();
        let resolved = options.schedule.resolve(now, self.config.timezone)?;

        let mut job = Job::new(name, payload)
            .with_max_attempts(max_attempts)
            .with_backoff(options.backoff.unwrap_or(self.config.default_backoff))
            .with_retention(options.retention.unwrap_or(self.config.retention));
        job.created_at = now;
        job.run_at = resolved.run_at;
        job.state = resolved.state;

        match resolved.recurrence {
            Some(recurrence) => {
                let key = recurrence.series_key(&job.name);
                job.repeat = Some(RepeatInfo {
                    key: key.clone(),
                    occurrence: 1,
                    recurrence: recurrence.clone(),
                });
                let series = RepeatSeries {
                    key: key.clone(),
                    name: job.name.clone(),
                    payload: job.payload.clone(),
                    recurrence,
                    max_attempts: job.max_attempts,
                    backoff: job.backoff,
                    retention: job.retention,
                    produced: 1,
                    latest_run_at: job.run_at,
                    latest_job: job.id,
                    created_at: now,
                };
                if !self.store.add_series(&series, &job).await? {
                    return Err(QueueError::DuplicateSeries(key));
                }
            }
            None => self.store.add_job(&job).await?,
        }
        self.announce(&job, now).await;

        info!(
            queue = %self.config.queue_name,
            job_id = %job.id,
            name = %job.name,
            state = %job.state,
            run_at = %job.run_at,
            "Job enqueued"
        );
        Ok(job)
    }

    async fn announce(&self, job: &Job, now: DateTime<Utc>) {
        let event = match job.state {
            JobState::Waiting => QueueEvent::Waiting { job_id: job.id },
            _ => QueueEvent::Delayed {
                job_id: job.id,
                delay_ms: millis_until(job.run_at - now),
            },
        };
        self.emit(event).await;
    }

    /// Get a job by id. `Ok(None)` if it does not exist (or was evicted).
    pub async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.store.read_job(id).await
    }

    /// Snapshot of jobs in `states`, sorted by `run_at` within each state.
    pub async fn list_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        self.store.list_jobs(states).await
    }

    /// Jobs waiting for their timer.
    pub async fn delayed_jobs(&self) -> QueueResult<Vec<Job>> {
        self.list_jobs(&[JobState::Delayed]).await
    }

    /// Registered recurring series.
    pub async fn list_recurring(&self) -> QueueResult<Vec<RepeatSeries>> {
        self.store.list_series().await
    }

    /// Stop a recurring series.
    ///
    /// The pending instance (delayed and never dispatched) is deleted.
    /// Waiting and active instances, and instances waiting for a retry,
    /// run to completion but produce no successor. Returns `false` if no
    /// such series is registered.
    pub async fn remove_recurring(&self, name: &str, schedule: &ScheduleSpec) -> QueueResult<bool> {
        let recurrence = schedule.recurrence(self.config.timezone)?.ok_or_else(|| {
            QueueError::InvalidSchedule("only interval and cron schedules recur".into())
        })?;
        let key = recurrence.series_key(name);

        if !self.store.remove_series(&key).await? {
            debug!(queue = %self.config.queue_name, series = %key, "No such recurring series");
            return Ok(false);
        }

        for job in self.delayed_jobs().await? {
            let pending = job.attempts_made == 0
                && job.processed_at.is_none()
                && job.repeat.as_ref().is_some_and(|repeat| repeat.key == key);
            if pending && self.store.remove_job(job.id).await? {
                self.emit(QueueEvent::Removed { job_id: job.id }).await;
            }
        }

        info!(queue = %self.config.queue_name, series = %key, "Recurring series removed");
        Ok(true)
    }

    /// Arm the next instance of the series `finished` belongs to.
    ///
    /// Called once per instance after it reached a terminal state. Ends the
    /// series when its limit is reached; does nothing if the series was
    /// removed or `finished` is not its latest instance.
    pub(crate) async fn schedule_next_occurrence(&self, finished: &Job) -> QueueResult<Option<Job>> {
        let Some(repeat) = &finished.repeat else {
            return Ok(None);
        };
        self.advance_series(&repeat.key, repeat.occurrence).await
    }

    /// Arm the successor of every series whose latest instance finished
    /// (or was evicted) without one, as happens when the store failed right
    /// after the instance settled. Returns the number of instances armed.
    pub(crate) async fn repair_series(&self) -> QueueResult<usize> {
        let mut armed = 0;
        for series in self.store.list_series().await? {
            let latest = self.store.read_job(series.latest_job).await?;
            if latest.is_some_and(|job| !job.state.is_terminal()) {
                continue;
            }
            if self.advance_series(&series.key, series.produced).await?.is_some() {
                warn!(
                    queue = %self.config.queue_name,
                    series = %series.key,
                    occurrence = series.produced + 1,
                    "Re-armed recurring series that had no pending instance"
                );
                armed += 1;
            }
        }
        Ok(armed)
    }

    async fn advance_series(&self, key: &str, occurrence: u32) -> QueueResult<Option<Job>> {
        let Some(series) = self.store.get_series(key).await? else {
            debug!(series = %key, "Series removed, not rescheduling");
            return Ok(None);
        };
        if series.produced != occurrence {
            return Ok(None);
        }
        if series.limit_reached() {
            self.store.remove_series(&series.key).await?;
            info!(
                queue = %self.config.queue_name,
                series = %series.key,
                produced = series.produced,
                "Recurring series reached its limit"
            );
            return Ok(None);
        }

        let now = Utc::now();
        let run_at = series.recurrence.next_after(series.latest_run_at)?;
        let mut job = Job::new(series.name.clone(), series.payload.clone())
            .with_max_attempts(series.max_attempts)
            .with_backoff(series.backoff)
            .with_retention(series.retention)
            .with_repeat(RepeatInfo {
                key: series.key.clone(),
                occurrence: series.produced + 1,
                recurrence: series.recurrence.clone(),
            })
            .delayed_until(run_at);
        job.created_at = now;

        let next = RepeatSeries {
            produced: series.produced + 1,
            latest_run_at: run_at,
            latest_job: job.id,
            ..series.clone()
        };
        if !self.store.advance_series(&next, series.produced, &job).await? {
            debug!(series = %series.key, "Series changed concurrently, not rescheduling");
            return Ok(None);
        }
        self.announce(&job, now).await;

        debug!(
            series = %series.key,
            job_id = %job.id,
            occurrence = next.produced,
            run_at = %run_at,
            "Armed next occurrence"
        );
        Ok(Some(job))
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.config.queue_name)
            .field("store", &self.store.store_type())
            .finish()
    }
}
