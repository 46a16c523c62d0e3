//! Worker pool for processing jobs.
//!
//! A single dispatcher task claims jobs while it holds a free concurrency
//! slot and, if configured, a rate-limit start. Each claimed job runs in its
//! own task which keeps the lease alive and records the outcome.

use crate::backoff::LoopBackoff;
use crate::error::{QueueError, QueueResult};
use crate::events::QueueEvent;
use crate::job::{AttemptOutcome, Job, JobData, JobId};
use crate::queue::Queue;
use crate::store::{Claim, LeaseToken};
use async_trait::async_trait;
use chrono::Utc;
use kairos_ratelimit::{DispatchLimiter, Permit};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Attempts at recording an outcome before giving the job up to stall
/// recovery.
const RELEASE_ATTEMPTS: u32 = 5;

/// Executes jobs of one name. Closures are registered through
/// [`HandlerRegistry::register`].
///
/// Return `QueueError::Unrecoverable` to fail the job without retries; any
/// other error is retried according to the job's backoff.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job and produce its result.
    async fn handle(&self, job: Job) -> QueueResult<JobData>;
}

/// Adapter running a closure as a [`JobHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = QueueResult<JobData>> + Send,
{
    async fn handle(&self, job: Job) -> QueueResult<JobData> {
        (self.0)(job).await
    }
}

/// Job name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure as the handler of `name`.
    ///
    /// # Examples
    ///
    /// ```
    /// use kairos_queue::*;
    ///
    /// let mut handlers = HandlerRegistry::new();
    /// handlers.register("send-email", |job: Job| async move {
    ///     // Send email logic
    ///     Ok(serde_json::json!({ "to": job.payload["to"] }))
    /// });
    /// assert!(handlers.contains("send-email"));
    /// ```
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<JobData>> + Send + 'static,
    {
        self.register_handler(name, FnHandler(handler))
    }

    /// Register a [`JobHandler`] implementation as the handler of `name`.
    pub fn register_handler<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with_handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<JobData>> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Dispatch rate cap: at most `max` job starts in any rolling `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Starts per window
    pub max: u64,
    /// Window length
    pub window: Duration,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent jobs to process
    pub concurrency: usize,

    /// Poll interval when the ready list is empty
    pub poll_interval: Duration,

    /// Lease taken on each claimed job, renewed every half lease
    pub lease_duration: Duration,

    /// Optional cap on one handler run. Off by default: handlers are never
    /// cancelled unless this is set, and a run that hits it counts as a
    /// failed, retryable attempt.
    pub job_timeout: Option<Duration>,

    /// Optional dispatch rate cap
    pub rate_limit: Option<RateLimit>,

    /// Upper bound of the pause after store errors
    pub max_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(30),
            job_timeout: None,
            rate_limit: None,
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Set concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Abort handler runs that take longer than `timeout`.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Cap dispatch starts at `max` per `window`.
    pub fn with_rate_limit(mut self, max: u64, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, window });
        self
    }

    fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".into()));
        }
        if self.lease_duration < Duration::from_millis(2) {
            return Err(QueueError::Config(
                "lease duration must be at least 2ms".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::Config("poll interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Worker pool for processing jobs from a queue.
pub struct Worker {
    dispatcher: Dispatcher,
    running: Arc<RwLock<bool>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker with default configuration.
    pub fn new(queue: Queue, handlers: HandlerRegistry) -> QueueResult<Self> {
        Self::with_config(queue, handlers, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    ///
    /// A configured rate limit is enforced per process. Use
    /// [`Worker::with_rate_limiter`] with a Redis-backed limiter to share
    /// it between processes.
    pub fn with_config(
        queue: Queue,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> QueueResult<Self> {
        config.validate()?;

        let limiter = config
            .rate_limit
            .map(|limit| {
                DispatchLimiter::in_memory(
                    format!("{}:dispatch", queue.config().key_prefix),
                    limit.max,
                    limit.window,
                )
            })
            .transpose()?;

        if handlers.is_empty() {
            warn!(queue = %queue.name(), "Worker created without handlers");
        }

        Ok(Self {
            dispatcher: Dispatcher {
                queue,
                handlers: Arc::new(handlers),
                config: Arc::new(config),
                limiter,
            },
            running: Arc::new(RwLock::new(false)),
            shutdown: None,
            handle: None,
        })
    }

    /// Replace the dispatch rate limiter.
    pub fn with_rate_limiter(mut self, limiter: DispatchLimiter) -> Self {
        self.dispatcher.limiter = Some(limiter);
        self
    }

    /// Start the worker.
    pub async fn start(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        *running = true;
        drop(running);

        info!(
            queue = %self.dispatcher.queue.name(),
            concurrency = self.dispatcher.config.concurrency,
            rate_limit = ?self.dispatcher.limiter,
            handlers = ?self.dispatcher.handlers.names(),
            "Starting worker"
        );

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        let dispatcher = self.dispatcher.clone();
        self.handle = Some(tokio::spawn(dispatcher.run(rx)));
        Ok(())
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::WorkerNotRunning);
        }
        *running = false;
        drop(running);

        info!(queue = %self.dispatcher.queue.name(), "Stopping worker...");

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "Worker dispatcher ended abnormally");
        }

        info!(queue = %self.dispatcher.queue.name(), "Worker stopped");
        Ok(())
    }

    /// Check if the worker is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[derive(Clone)]
struct Dispatcher {
    queue: Queue,
    handlers: Arc<HandlerRegistry>,
    config: Arc<WorkerConfig>,
    limiter: Option<DispatchLimiter>,
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `true`
/// on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

fn failure_reason(error: &QueueError) -> String {
    match error {
        QueueError::Execution(msg) | QueueError::Unrecoverable(msg) => msg.clone(),
        other => other.to_string(),
    }
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        let mut backoff = LoopBackoff::new(self.config.poll_interval, self.config.max_error_backoff);

        loop {
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "Job task ended abnormally");
                }
            }

            let slot = tokio::select! {
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let start = match &self.limiter {
                Some(limiter) => tokio::select! {
                    acquired = limiter.acquire() => match acquired {
                        Ok(permit) => Some(permit),
                        Err(e) => {
                            drop(slot);
                            let delay = backoff.next_delay();
                            warn!(error = %e, retry_in = ?delay, "Rate limiter unavailable");
                            if pause(delay, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                },
                None => None,
            };

            match self.queue.store().claim_next(self.config.lease_duration).await {
                Ok(Some(claim)) => {
                    backoff.reset();
                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        dispatcher.process(claim).await;
                        drop(slot);
                    });
                }
                Ok(None) => {
                    backoff.reset();
                    self.refund(start).await;
                    drop(slot);
                    if pause(self.config.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    self.refund(start).await;
                    drop(slot);
                    let delay = backoff.next_delay();
                    warn!(
                        queue = %self.queue.name(),
                        error = %e,
                        failures = backoff.failures(),
                        retry_in = ?delay,
                        "Failed to claim job"
                    );
                    if pause(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight jobs");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Job task ended abnormally");
            }
        }
        debug!(queue = %self.queue.name(), "Dispatcher stopped");
    }

    async fn refund(&self, start: Option<Permit>) {
        if let (Some(limiter), Some(permit)) = (&self.limiter, start)
            && let Err(e) = limiter.refund(permit).await
        {
            warn!(error = %e, "Failed to refund rate limit start");
        }
    }

    async fn process(&self, claim: Claim) {
        let Claim { job, token } = claim;
        let job_id = job.id;

        debug!(
            job_id = %job_id,
            name = %job.name,
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );
        self.queue.emit(QueueEvent::Active { job_id }).await;

        let heartbeat = self.spawn_heartbeat(job_id, token);
        let outcome = self.execute(&job).await;
        heartbeat.abort();

        match self.settle(job, token, outcome).await {
            Ok(()) => {}
            Err(QueueError::LeaseExpired(id)) => {
                warn!(job_id = %id, "Lease lost before the outcome was recorded; outcome discarded");
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record job outcome");
            }
        }
    }

    fn spawn_heartbeat(&self, job_id: JobId, token: LeaseToken) -> JoinHandle<()> {
        let store = self.queue.store().clone();
        let lease = self.config.lease_duration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 2);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lease(job_id, token, lease).await {
                    Ok(true) => trace!(job_id = %job_id, "Lease renewed"),
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lease lost while the job was running");
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to renew lease"),
                }
            }
        })
    }

    async fn execute(&self, job: &Job) -> QueueResult<JobData> {
        let Some(handler) = self.handlers.get(&job.name) else {
            return Err(QueueError::UnknownHandler(job.name.clone()));
        };

        let input = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(input).await });

        let joined = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(QueueError::Execution(format!("job timed out after {:?}", limit)));
                }
            },
            None => task.await,
        };

        joined.unwrap_or_else(|e| Err(QueueError::Execution(format!("handler panicked: {}", e))))
    }

    async fn settle(
        &self,
        mut job: Job,
        token: LeaseToken,
        outcome: QueueResult<JobData>,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let job_id = job.id;

        let (rearm_at, event) = match outcome {
            Ok(result) => {
                job.mark_completed(result.clone(), now)?;
                (None, QueueEvent::Completed { job_id, result })
            }
            Err(e) => {
                let reason = failure_reason(&e);
                match job.record_failure(reason.clone(), e.is_retryable(), now)? {
                    AttemptOutcome::Retry { delay, run_at } => (
                        Some(run_at),
                        QueueEvent::Delayed {
                            job_id,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        },
                    ),
                    AttemptOutcome::Exhausted => (
                        None,
                        QueueEvent::Failed {
                            job_id,
                            reason,
                            attempts_made: job.attempts_made,
                        },
                    ),
                }
            }
        };

        if !self.release(&job, token, rearm_at).await? {
            return Err(QueueError::LeaseExpired(job_id));
        }

        match &event {
            QueueEvent::Completed { .. } => {
                info!(job_id = %job_id, name = %job.name, "Job completed");
            }
            QueueEvent::Delayed { delay_ms, .. } => warn!(
                job_id = %job_id,
                name = %job.name,
                attempts_made = job.attempts_made,
                retry_in_ms = delay_ms,
                reason = job.failure_reason.as_deref().unwrap_or_default(),
                "Job failed, retry scheduled"
            ),
            _ => error!(
                job_id = %job_id,
                name = %job.name,
                attempts_made = job.attempts_made,
                reason = job.failure_reason.as_deref().unwrap_or_default(),
                "Job failed permanently"
            ),
        }
        self.queue.emit(event).await;

        if job.state.is_terminal()
            && let Err(e) = self.queue.schedule_next_occurrence(&job).await
        {
            error!(
                job_id = %job_id,
                error = %e,
                "Failed to schedule next occurrence; left to the scheduler's series repair"
            );
        }
        Ok(())
    }

    /// Record the outcome, retrying store errors a few times.
    async fn release(
        &self,
        job: &Job,
        token: LeaseToken,
        rearm_at: Option<chrono::DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let mut backoff = LoopBackoff::new(Duration::from_millis(100), self.config.max_error_backoff);
        loop {
            match self.queue.store().release_lease(job, token, rearm_at).await {
                Ok(released) => return Ok(released),
                Err(e) if backoff.failures() + 1 < RELEASE_ATTEMPTS => {
                    let delay = backoff.next_delay();
                    warn!(job_id = %job.id, error = %e, retry_in = ?delay, "Failed to record outcome");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
