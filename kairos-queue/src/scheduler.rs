//! Scheduler: promotes due timers, recovers stalled jobs and sweeps
//! retention.
//!
//! Two independent loops run per scheduler. The tick loop promotes every
//! due timer (in batches, so a long outage is caught up in one tick) and
//! reclaims expired leases. The retention loop evicts finished jobs and
//! re-arms recurring series whose successor was never created. Store errors
//! in either loop are logged and retried with bounded exponential backoff;
//! they never end the loop.

use crate::backoff::LoopBackoff;
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::{JobId, JobState};
use crate::queue::Queue;
use crate::retention;
use crate::store::LeaseToken;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks
    pub tick_interval: Duration,

    /// Maximum timers promoted per store call
    pub promote_batch: usize,

    /// Interval between retention sweeps
    pub retention_interval: Duration,

    /// Upper bound of the pause after store errors
    pub max_error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            promote_batch: 1000,
            retention_interval: Duration::from_secs(60),
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the retention sweep interval.
    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Timers moved to the ready list
    pub promoted: usize,
    /// Stalled jobs requeued or failed
    pub recovered: usize,
}

/// Periodic scheduler for one queue.
pub struct Scheduler {
    queue: Queue,
    config: SchedulerConfig,
    running: Arc<RwLock<bool>>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with default configuration.
    pub fn new(queue: Queue) -> Self {
        Self::with_config(queue, SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration.
    pub fn with_config(queue: Queue, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            running: Arc::new(RwLock::new(false)),
            shutdown: None,
            handles: Vec::new(),
        }
    }

    /// Run one promotion and stall-recovery pass now.
    pub async fn tick(&self) -> QueueResult<TickReport> {
        tick(&self.queue, &self.config, Utc::now()).await
    }

    /// Run one retention sweep now. Returns the number of evicted jobs.
    pub async fn sweep_retention(&self) -> QueueResult<usize> {
        retention::sweep(&self.queue, Utc::now()).await
    }

    /// Arm the next instance of every recurring series whose latest
    /// instance finished without one. Returns the number of instances armed.
    ///
    /// Runs on the retention interval as well.
    pub async fn repair_series(&self) -> QueueResult<usize> {
        self.queue.repair_series().await
    }

    /// Start the background loops.
    pub async fn start(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::SchedulerAlreadyRunning);
        }
        *running = true;
        drop(running);

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        info!(
            queue = %self.queue.name(),
            tick = ?self.config.tick_interval,
            retention = ?self.config.retention_interval,
            "Starting scheduler"
        );

        let queue = self.queue.clone();
        let config = self.config.clone();
        let shutdown = rx.clone();
        self.handles.push(tokio::spawn(async move {
            run_loop(
                "tick",
                config.tick_interval,
                config.max_error_backoff,
                shutdown,
                || {
                    let queue = queue.clone();
                    let config = config.clone();
                    async move { tick(&queue, &config, Utc::now()).await.map(|_| ()) }
                },
            )
            .await;
        }));

        let queue = self.queue.clone();
        let config = self.config.clone();
        self.handles.push(tokio::spawn(async move {
            run_loop(
                "retention",
                config.retention_interval,
                config.max_error_backoff,
                rx,
                || {
                    let queue = queue.clone();
                    async move { maintain(&queue, Utc::now()).await }
                },
            )
            .await;
        }));

        Ok(())
    }

    /// Stop the loops, letting a pass in progress finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::SchedulerNotRunning);
        }
        *running = false;
        drop(running);

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(queue = %self.queue.name(), error = %e, "Scheduler task ended abnormally");
            }
        }

        info!(queue = %self.queue.name(), "Scheduler stopped");
        Ok(())
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    max_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = QueueResult<()>>,
{
    let mut backoff = LoopBackoff::new(interval, max_backoff);
    let mut pause = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match pass().await {
            Ok(()) => {
                if backoff.failures() > 0 {
                    info!(task = name, "Scheduler task recovered");
                }
                backoff.reset();
                pause = interval;
            }
            Err(e) => {
                pause = backoff.next_delay();
                warn!(
                    task = name,
                    error = %e,
                    failures = backoff.failures(),
                    retry_in = ?pause,
                    "Scheduler pass failed"
                );
            }
        }
    }

    debug!(task = name, "Scheduler task stopped");
}

async fn tick(queue: &Queue, config: &SchedulerConfig, now: DateTime<Utc>) -> QueueResult<TickReport> {
    let store = queue.store();
    let batch = config.promote_batch.max(1);
    let mut report = TickReport::default();

    loop {
        let promoted = store.promote_due_timers(now, batch).await?;
        let count = promoted.len();
        for job_id in promoted {
            queue.emit(QueueEvent::Waiting { job_id }).await;
        }
        report.promoted += count;
        if count < batch {
            break;
        }
    }

    report.recovered = recover_stalled(queue, now).await?;

    if report.promoted > 0 || report.recovered > 0 {
        debug!(
            queue = %queue.name(),
            promoted = report.promoted,
            recovered = report.recovered,
            "Scheduler tick"
        );
    }
    Ok(report)
}

/// Reclaim expired leases: the attempt counts as failed and the job goes back
/// to `waiting`, or to `failed` once attempts run out.
///
/// Each lease stays in place until its job's new state is written, so a store
/// error leaves the rest for the next tick. The first error is returned after
/// every lease has been tried.
async fn recover_stalled(queue: &Queue, now: DateTime<Utc>) -> QueueResult<usize> {
    let mut recovered = 0;
    let mut first_error = None;

    for (id, token) in queue.store().expired_leases(now).await? {
        match recover_one(queue, id, token, now).await {
            Ok(true) => recovered += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(queue = %queue.name(), job_id = %id, error = %e, "Failed to recover stalled job");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(recovered),
    }
}

async fn recover_one(queue: &Queue, id: JobId, token: LeaseToken, now: DateTime<Utc>) -> QueueResult<bool> {
    let store = queue.store();
    let mut job = match store.read_job(id).await? {
        Some(job) if matches!(job.state, JobState::Active | JobState::Waiting) => job,
        // removed or already settled: only the lease is left
        _ => {
            store.reclaim_lease(id, token, now, None).await?;
            return Ok(false);
        }
    };

    // claimed but never marked active before the claimer died
    if job.state == JobState::Waiting {
        return store.reclaim_lease(id, token, now, Some(&job)).await;
    }

    let requeued = job.mark_stalled(now)?;
    if !store.reclaim_lease(id, token, now, Some(&job)).await? {
        debug!(job_id = %id, "Lease renewed before it could be reclaimed");
        return Ok(false);
    }

    warn!(
        queue = %queue.name(),
        job_id = %id,
        attempts_made = job.attempts_made,
        requeued = requeued,
        "Job stalled: lease expired"
    );
    queue
        .emit(QueueEvent::Stalled {
            job_id: id,
            attempts_made: job.attempts_made,
        })
        .await;

    if requeued {
        queue.emit(QueueEvent::Waiting { job_id: id }).await;
    } else {
        queue
            .emit(QueueEvent::Failed {
                job_id: id,
                reason: job.failure_reason.clone().unwrap_or_default(),
                attempts_made: job.attempts_made,
            })
            .await;
        queue.schedule_next_occurrence(&job).await?;
    }
    Ok(true)
}

/// Retention sweep, then re-arm series left without a pending instance.
async fn maintain(queue: &Queue, now: DateTime<Utc>) -> QueueResult<()> {
    retention::sweep(queue, now).await?;
    queue.repair_series().await?;
    Ok(())
}
