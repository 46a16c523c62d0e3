//! Integration tests for kairos-queue

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use kairos_queue::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};

struct Harness {
    queue: Queue,
    store: Arc<MemoryStore>,
    bus: BroadcastEventBus,
}

fn harness_with(config: QueueConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = BroadcastEventBus::default();
    let queue = Queue::new(store.clone(), Arc::new(bus.clone()), config).unwrap();
    Harness { queue, store, bus }
}

fn harness() -> Harness {
    harness_with(QueueConfig::new("redis://localhost:6379", "test"))
}

fn fast_scheduler(queue: &Queue) -> Scheduler {
    Scheduler::with_config(
        queue.clone(),
        SchedulerConfig::default().with_tick_interval(Duration::from_millis(20)),
    )
}

fn fast_worker(queue: &Queue, handlers: HandlerRegistry) -> Worker {
    Worker::with_config(
        queue.clone(),
        handlers,
        WorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

async fn wait_for<F>(events: &mut broadcast::Receiver<QueueEvent>, predicate: F) -> QueueEvent
where
    F: Fn(&QueueEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Memory store whose operations can be made to fail a set number of times.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl FlakyStore {
    fn fail(&self, op: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(op, times);
    }

    fn check(&self, op: &'static str) -> QueueResult<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(QueueError::StoreUnavailable(format!("{}: connection reset", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn write_job(&self, job: &Job) -> QueueResult<()> {
        self.check("write_job")?;
        self.inner.write_job(job).await
    }

    async fn read_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.check("read_job")?;
        self.inner.read_job(id).await
    }

    async fn list_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        self.check("list_jobs")?;
        self.inner.list_jobs(states).await
    }

    async fn remove_job(&self, id: JobId) -> QueueResult<bool> {
        self.check("remove_job")?;
        self.inner.remove_job(id).await
    }

    async fn add_job(&self, job: &Job) -> QueueResult<()> {
        self.check("add_job")?;
        self.inner.add_job(job).await
    }

    async fn promote_due_timers(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<JobId>> {
        self.check("promote_due_timers")?;
        self.inner.promote_due_timers(now, limit).await
    }

    async fn claim_next(&self, lease: Duration) -> QueueResult<Option<Claim>> {
        self.check("claim_next")?;
        self.inner.claim_next(lease).await
    }

    async fn renew_lease(&self, id: JobId, token: LeaseToken, lease: Duration) -> QueueResult<bool> {
        self.check("renew_lease")?;
        self.inner.renew_lease(id, token, lease).await
    }

    async fn release_lease(
        &self,
        job: &Job,
        token: LeaseToken,
        rearm_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        self.check("release_lease")?;
        self.inner.release_lease(job, token, rearm_at).await
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<(JobId, LeaseToken)>> {
        self.check("expired_leases")?;
        self.inner.expired_leases(now).await
    }

    async fn reclaim_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        now: DateTime<Utc>,
        recovered: Option<&Job>,
    ) -> QueueResult<bool> {
        self.check("reclaim_lease")?;
        self.inner.reclaim_lease(id, token, now, recovered).await
    }

    async fn add_series(&self, series: &RepeatSeries, first: &Job) -> QueueResult<bool> {
        self.check("add_series")?;
        self.inner.add_series(series, first).await
    }

    async fn advance_series(
        &self,
        series: &RepeatSeries,
        expected_produced: u32,
        next: &Job,
    ) -> QueueResult<bool> {
        self.check("advance_series")?;
        self.inner.advance_series(series, expected_produced, next).await
    }

    async fn get_series(&self, key: &str) -> QueueResult<Option<RepeatSeries>> {
        self.check("get_series")?;
        self.inner.get_series(key).await
    }

    async fn remove_series(&self, key: &str) -> QueueResult<bool> {
        self.check("remove_series")?;
        self.inner.remove_series(key).await
    }

    async fn list_series(&self) -> QueueResult<Vec<RepeatSeries>> {
        self.check("list_series")?;
        self.inner.list_series().await
    }

    fn store_type(&self) -> &'static str {
        "flaky"
    }
}

fn flaky_harness() -> (Queue, Arc<FlakyStore>, BroadcastEventBus) {
    let store = Arc::new(FlakyStore::default());
    let bus = BroadcastEventBus::default();
    let queue = Queue::new(
        store.clone(),
        Arc::new(bus.clone()),
        QueueConfig::new("redis://localhost:6379", "flaky"),
    )
    .unwrap();
    (queue, store, bus)
}

#[tokio::test]
async fn test_scheduled_job_end_to_end() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let mut handlers = HandlerRegistry::new();
    handlers.register("send-email", |job: Job| async move {
        Ok(json!({ "delivered_to": job.payload["to"] }))
    });

    let run_at = Utc::now() + chrono::Duration::milliseconds(300);
    let job = h
        .queue
        .enqueue(
            "send-email",
            json!({ "to": "user@example.com" }),
            JobOptions::at(run_at),
        )
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.run_at, run_at);

    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let id = job.id;
    wait_for(&mut events, |event| {
        event.job_id() == id && matches!(event, QueueEvent::Completed { .. })
    })
    .await;

    // another tick must not run it again
    scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if event.job_id() == id && matches!(event, QueueEvent::Completed { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);

    let done = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.result, Some(json!({ "delivered_to": "user@example.com" })));
    assert_eq!(done.attempts_made, 0);
    assert!(done.processed_at.unwrap() >= run_at);
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn test_lifecycle_event_order() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!(1)) });
    let job = h
        .queue
        .enqueue("t", json!({}), JobOptions::delay(Duration::from_millis(50)))
        .await
        .unwrap();

    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let mut kinds = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.job_id() == job.id {
                kinds.push(event.kind());
                if event.kind() == "completed" {
                    break;
                }
            }
        }
    })
    .await
    .expect("job did not complete");

    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(kinds, vec!["delayed", "waiting", "active", "completed"]);
}

#[tokio::test]
async fn test_retries_with_exponential_backoff_then_fail() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let calls = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let recorded = calls.clone();
    let handlers = HandlerRegistry::new().with_handler("flaky", move |_job: Job| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push(Instant::now());
            Err(QueueError::execution("smtp timeout"))
        }
    });

    let job = h
        .queue
        .enqueue(
            "flaky",
            json!({}),
            JobOptions::new()
                .max_attempts(3)
                .backoff(BackoffPolicy::exponential(Duration::from_millis(100))),
        )
        .await
        .unwrap();

    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let mut delays = Vec::new();
    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                QueueEvent::Delayed { job_id, delay_ms } if job_id == job.id => delays.push(delay_ms),
                event @ QueueEvent::Failed { .. } if event.job_id() == job.id => return event,
                _ => {}
            }
        }
    })
    .await
    .expect("job did not fail");

    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    // the enqueue itself was immediate, so only retries show up as delays
    assert_eq!(delays, vec![100, 200]);
    assert_eq!(
        failed,
        QueueEvent::Failed {
            job_id: job.id,
            reason: "smtp timeout".into(),
            attempts_made: 3,
        }
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(100));
    assert!(calls[2] - calls[1] >= Duration::from_millis(200));

    let stored = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts_made, stored.max_attempts);
    assert_eq!(stored.failure_reason.as_deref(), Some("smtp timeout"));
}

#[tokio::test]
async fn test_unknown_handler_fails_without_retry() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let job = h
        .queue
        .enqueue("resize-image", json!({}), JobOptions::new().max_attempts(5))
        .await
        .unwrap();

    let mut worker = fast_worker(&h.queue, HandlerRegistry::new());
    worker.start().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, QueueEvent::Failed { .. })).await;
    worker.stop().await.unwrap();

    assert_eq!(event.job_id(), job.id);
    let stored = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts_made, 1);
    assert!(stored.failure_reason.unwrap().contains("resize-image"));
    assert_eq!(h.store.timer_count(), 0);
}

#[tokio::test]
async fn test_unrecoverable_error_is_terminal() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let handlers = HandlerRegistry::new().with_handler("parse", |_job: Job| async {
        Err(QueueError::unrecoverable("malformed payload"))
    });
    let job = h.queue.enqueue("parse", json!("%%"), JobOptions::new()).await.unwrap();

    let mut worker = fast_worker(&h.queue, handlers);
    worker.start().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, QueueEvent::Failed { .. })).await;
    worker.stop().await.unwrap();

    assert_eq!(
        event,
        QueueEvent::Failed {
            job_id: job.id,
            reason: "malformed payload".into(),
            attempts_made: 1,
        }
    );
}

#[tokio::test]
async fn test_handler_panic_is_retried() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handlers = HandlerRegistry::new().with_handler("fragile", move |_job: Job| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first attempt explodes");
            }
            Ok(json!("recovered"))
        }
    });

    let job = h
        .queue
        .enqueue(
            "fragile",
            json!({}),
            JobOptions::new().backoff(BackoffPolicy::fixed(Duration::from_millis(10))),
        )
        .await
        .unwrap();

    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    let stored = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts_made, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_interval_series_respects_limit() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let handlers = HandlerRegistry::new().with_handler("heartbeat", move |job: Job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "occurrence": job.repeat.map(|r| r.occurrence) }))
        }
    });

    let schedule = ScheduleSpec::every(Duration::from_millis(100)).with_limit(2);
    let first = h
        .queue
        .enqueue("heartbeat", json!({}), JobOptions::with_schedule(schedule))
        .await
        .unwrap();
    assert_eq!(h.queue.list_recurring().await.unwrap().len(), 1);

    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        if let QueueEvent::Completed { job_id, .. } =
            wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await
        {
            completed.push(job_id);
        }
    }

    // give a third occurrence every chance to show up
    tokio::time::sleep(Duration::from_millis(400)).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(completed[0], first.id);
    assert!(h.queue.list_recurring().await.unwrap().is_empty());
    assert!(h.queue.delayed_jobs().await.unwrap().is_empty());

    let second = h.queue.get_job(completed[1]).await.unwrap().unwrap();
    assert_eq!(second.run_at, first.run_at + chrono::Duration::milliseconds(100));
    assert_eq!(second.result, Some(json!({ "occurrence": 2 })));
}

#[tokio::test]
async fn test_cron_series_in_timezone() {
    let h = harness_with(
        QueueConfig::new("redis://localhost:6379", "reports").with_timezone(chrono_tz::Asia::Kolkata),
    );

    let job = h
        .queue
        .enqueue(
            "daily-report",
            json!({}),
            JobOptions::with_schedule(ScheduleSpec::cron("0 9 * * *")),
        )
        .await
        .unwrap();

    let local = job.run_at.with_timezone(&chrono_tz::Asia::Kolkata);
    assert_eq!((local.hour(), local.minute(), local.second()), (9, 0, 0));
    assert!(job.run_at > Utc::now());

    let series = h.queue.list_recurring().await.unwrap();
    assert_eq!(series[0].key, "daily-report:cron:0 9 * * *:Asia/Kolkata");

    let removed = h
        .queue
        .remove_recurring("daily-report", &ScheduleSpec::cron("0 9 * * *"))
        .await
        .unwrap();
    assert!(removed);
    assert!(h.queue.get_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retention_evicts_beyond_count() {
    let h = harness_with(
        QueueConfig::new("redis://localhost:6379", "test").with_retention(RetentionConfig {
            completed: RetentionPolicy::max_count(1),
            failed: RetentionPolicy::keep_all(),
        }),
    );
    let mut events = h.bus.subscribe();

    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!(null)) });
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap().id);
    }

    let mut worker = Worker::with_config(
        h.queue.clone(),
        handlers,
        WorkerConfig::default()
            .with_concurrency(1)
            .with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap();
    worker.start().await.unwrap();
    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    }
    worker.stop().await.unwrap();

    let scheduler = fast_scheduler(&h.queue);
    assert_eq!(scheduler.sweep_retention().await.unwrap(), 2);

    assert!(h.queue.get_job(ids[0]).await.unwrap().is_none());
    assert!(h.queue.get_job(ids[1]).await.unwrap().is_none());
    assert!(h.queue.get_job(ids[2]).await.unwrap().is_some());
    assert_eq!(scheduler.sweep_retention().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retention_evicts_by_age() {
    let h = harness();
    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!(null)) });
    let mut events = h.bus.subscribe();

    let short_lived = RetentionConfig {
        completed: RetentionPolicy::max_age(Duration::ZERO),
        failed: RetentionPolicy::keep_all(),
    };
    let job = h
        .queue
        .enqueue("t", json!({}), JobOptions::new().retention(short_lived))
        .await
        .unwrap();

    let mut worker = fast_worker(&h.queue, handlers);
    worker.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    worker.stop().await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let scheduler = fast_scheduler(&h.queue);
    assert_eq!(scheduler.sweep_retention().await.unwrap(), 1);
    assert!(h.queue.get_job(job.id).await.unwrap().is_none());

    let removed = wait_for(&mut events, |e| matches!(e, QueueEvent::Removed { .. })).await;
    assert_eq!(removed.job_id(), job.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_never_share_a_job() {
    let h = harness();

    let running = Arc::new(Mutex::new(HashSet::new()));
    let executions = Arc::new(Mutex::new(HashMap::<JobId, u32>::new()));
    let overlaps = Arc::new(AtomicU32::new(0));

    let make_handlers = || {
        let running = running.clone();
        let executions = executions.clone();
        let overlaps = overlaps.clone();
        HandlerRegistry::new().with_handler("work", move |job: Job| {
            let running = running.clone();
            let executions = executions.clone();
            let overlaps = overlaps.clone();
            async move {
                if !running.lock().unwrap().insert(job.id) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                *executions.lock().unwrap().entry(job.id).or_insert(0) += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.lock().unwrap().remove(&job.id);
                Ok(json!(null))
            }
        })
    };

    let mut ids = Vec::new();
    for n in 0..40 {
        ids.push(h.queue.enqueue("work", json!({ "n": n }), JobOptions::new()).await.unwrap().id);
    }

    let config = WorkerConfig::default()
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(5));
    let mut a = Worker::with_config(h.queue.clone(), make_handlers(), config.clone()).unwrap();
    let mut b = Worker::with_config(h.queue.clone(), make_handlers(), config).unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = h.queue.list_jobs(&[JobState::Completed]).await.unwrap();
            if done.len() == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not finish");

    a.stop().await.unwrap();
    b.stop().await.unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), ids.len());
    assert!(executions.values().all(|count| *count == 1));
}

#[tokio::test]
async fn test_crashed_worker_job_is_recovered() {
    let h = harness();
    let mut events = h.bus.subscribe();

    let job = h.queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();

    // a worker claims the job and dies without renewing its lease
    let claim = h.store.claim_next(Duration::from_millis(50)).await.unwrap().unwrap();
    assert_eq!(claim.job.id, job.id);

    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!("ok")) });
    let mut scheduler = fast_scheduler(&h.queue);
    let mut worker = fast_worker(&h.queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let stalled = wait_for(&mut events, |e| matches!(e, QueueEvent::Stalled { .. })).await;
    assert_eq!(
        stalled,
        QueueEvent::Stalled {
            job_id: job.id,
            attempts_made: 1
        }
    );
    wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    // the dead worker's late outcome is rejected
    let mut late = claim.job.clone();
    late.mark_failed("too late", Utc::now()).unwrap();
    assert!(!h.store.release_lease(&late, claim.token, None).await.unwrap());

    let stored = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts_made, 1);
}

#[tokio::test]
async fn test_rate_limit_spreads_starts() {
    let h = harness();
    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!(null)) });
    for _ in 0..12 {
        h.queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();
    }

    let started = Instant::now();
    let mut worker = Worker::with_config(
        h.queue.clone(),
        handlers,
        WorkerConfig::default()
            .with_concurrency(10)
            .with_poll_interval(Duration::from_millis(5))
            .with_rate_limit(5, Duration::from_millis(200)),
    )
    .unwrap();
    worker.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = h.queue.list_jobs(&[JobState::Completed]).await.unwrap();
            if done.len() == 12 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not finish");
    worker.stop().await.unwrap();

    // 5 + 5 + 2 starts need three windows
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight_job() {
    let h = harness();
    let handlers = HandlerRegistry::new().with_handler("slow", |_job: Job| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("done"))
    });
    let mut events = h.bus.subscribe();
    let job = h.queue.enqueue("slow", json!({}), JobOptions::new()).await.unwrap();

    let mut worker = fast_worker(&h.queue, handlers);
    worker.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, QueueEvent::Active { .. })).await;
    worker.stop().await.unwrap();

    let stored = h.queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
}

#[tokio::test]
async fn test_schedule_request_validation() {
    let h = harness();

    let ambiguous: ScheduleRequest =
        serde_json::from_value(json!({ "delay": 1000, "repeat": { "every": 1000 } })).unwrap();
    assert!(matches!(
        ScheduleSpec::try_from(ambiguous),
        Err(QueueError::InvalidSchedule(_))
    ));

    let request: ScheduleRequest = serde_json::from_value(json!({ "delay": 0 })).unwrap();
    let spec = ScheduleSpec::try_from(request).unwrap();
    let job = h
        .queue
        .enqueue("t", json!({}), JobOptions::with_schedule(spec))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Waiting);

    let past = h
        .queue
        .enqueue(
            "t",
            json!({}),
            JobOptions::at(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await;
    assert!(matches!(past, Err(QueueError::InvalidSchedule(_))));
}

#[tokio::test]
async fn test_worker_from_settings() {
    let settings = Settings::from_toml_str(
        r#"
        queue_name = "settings"

        [worker]
        concurrency = 2
        poll_interval_ms = 10
        "#,
    )
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let bus = BroadcastEventBus::default();
    let mut events = bus.subscribe();
    let queue = Queue::new(store, Arc::new(bus), settings.queue_config().unwrap()).unwrap();
    assert_eq!(queue.config().key_prefix, "kairos:queue:settings");

    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!(1)) });
    let mut worker = Worker::with_config(queue.clone(), handlers, settings.worker_config()).unwrap();
    queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();
    worker.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_stall_recovery_survives_store_error() {
    let (queue, store, _bus) = flaky_harness();
    let first = queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();
    let second = queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();

    // both claimers die; their leases run out
    store.claim_next(Duration::from_millis(1)).await.unwrap().unwrap();
    store.claim_next(Duration::from_millis(1)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let scheduler = Scheduler::new(queue.clone());
    store.fail("read_job", 1);
    assert!(matches!(
        scheduler.tick().await,
        Err(QueueError::StoreUnavailable(_))
    ));

    // the job whose read failed kept its lease and is picked up again
    assert_eq!(scheduler.tick().await.unwrap().recovered, 1);
    assert_eq!(scheduler.tick().await.unwrap().recovered, 0);

    for id in [first.id, second.id] {
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 1);
    }
    let mut claimed = HashSet::new();
    while let Some(claim) = store.claim_next(Duration::from_secs(30)).await.unwrap() {
        claimed.insert(claim.job.id);
    }
    assert_eq!(claimed, HashSet::from([first.id, second.id]));
}

#[tokio::test]
async fn test_failed_reclaim_keeps_job_recoverable() {
    let (queue, store, _bus) = flaky_harness();
    let job = queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();
    store.claim_next(Duration::from_millis(1)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let scheduler = Scheduler::new(queue.clone());
    store.fail("reclaim_lease", 1);
    assert!(scheduler.tick().await.is_err());
    assert_eq!(queue.get_job(job.id).await.unwrap().unwrap().state, JobState::Active);

    assert_eq!(scheduler.tick().await.unwrap().recovered, 1);
    let recovered = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Waiting);
    assert_eq!(recovered.attempts_made, 1);
    assert!(store.claim_next(Duration::from_secs(30)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_enqueue_leaves_nothing_behind() {
    let (queue, store, _bus) = flaky_harness();
    let schedule = ScheduleSpec::every(Duration::from_secs(60));

    store.fail("add_series", 1);
    let result = queue
        .enqueue("report", json!({}), JobOptions::with_schedule(schedule.clone()))
        .await;
    assert!(matches!(result, Err(QueueError::StoreUnavailable(_))));
    assert!(queue.list_recurring().await.unwrap().is_empty());
    assert!(store.inner.is_empty());

    // the key is free for a retry
    let job = queue
        .enqueue("report", json!({}), JobOptions::with_schedule(schedule))
        .await
        .unwrap();
    assert_eq!(queue.list_recurring().await.unwrap()[0].latest_job, job.id);
    assert_eq!(store.inner.timer_count(), 1);

    store.fail("add_job", 1);
    let delayed = queue
        .enqueue("t", json!({}), JobOptions::delay(Duration::from_secs(5)))
        .await;
    assert!(delayed.is_err());
    assert_eq!(store.inner.len(), 1);
    assert_eq!(store.inner.timer_count(), 1);
}

#[tokio::test]
async fn test_series_recovers_from_failed_regeneration() {
    let (queue, store, bus) = flaky_harness();
    let mut events = bus.subscribe();

    let handlers = HandlerRegistry::new().with_handler("heartbeat", |_job: Job| async { Ok(json!("ok")) });
    let schedule = ScheduleSpec::every(Duration::from_millis(50)).with_limit(3);
    queue
        .enqueue("heartbeat", json!({}), JobOptions::with_schedule(schedule))
        .await
        .unwrap();

    // the successor of the first instance cannot be written
    store.fail("advance_series", 1);

    let mut scheduler = Scheduler::with_config(
        queue.clone(),
        SchedulerConfig::default()
            .with_tick_interval(Duration::from_millis(20))
            .with_retention_interval(Duration::from_millis(50)),
    );
    let mut worker = fast_worker(&queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let mut occurrences = Vec::new();
    while occurrences.len() < 3 {
        if let QueueEvent::Completed { job_id, .. } =
            wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await
        {
            let job = queue.get_job(job_id).await.unwrap().unwrap();
            occurrences.push(job.repeat.map(|r| r.occurrence));
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(occurrences, vec![Some(1), Some(2), Some(3)]);
    assert!(queue.list_recurring().await.unwrap().is_empty());
    assert!(queue.delayed_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_loop_survives_store_errors() {
    let (queue, store, bus) = flaky_harness();
    let mut events = bus.subscribe();

    let job = queue
        .enqueue("t", json!({}), JobOptions::delay(Duration::from_millis(30)))
        .await
        .unwrap();
    store.fail("promote_due_timers", 3);
    store.fail("claim_next", 2);

    let handlers = HandlerRegistry::new().with_handler("t", |_job: Job| async { Ok(json!("ok")) });
    let mut scheduler = fast_scheduler(&queue);
    let mut worker = fast_worker(&queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let done = wait_for(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(done.job_id(), job.id);
    assert!(scheduler.tick().await.is_ok());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_queue_end_to_end() {
    let config = QueueConfig::new("redis://localhost:6379", format!("it-{}", uuid::Uuid::new_v4()));
    let queue = Queue::connect(config.clone()).await.unwrap();
    let bus = RedisEventBus::connect(&config.redis_url, config.events_channel())
        .await
        .unwrap();
    let mut events = bus.subscribe().await.unwrap();

    let handlers = HandlerRegistry::new().with_handler("send-email", |job: Job| async move {
        Ok(json!({ "to": job.payload["to"] }))
    });

    let job = queue
        .enqueue(
            "send-email",
            json!({ "to": "user@example.com" }),
            JobOptions::delay(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(queue.delayed_jobs().await.unwrap().len(), 1);

    let mut scheduler = fast_scheduler(&queue);
    let mut worker = fast_worker(&queue, handlers);
    scheduler.start().await.unwrap();
    worker.start().await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(event @ QueueEvent::Completed { .. }) = events.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();

    worker.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(completed.job_id(), job.id);
    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert!(queue.list_jobs(&[JobState::Delayed, JobState::Waiting]).await.unwrap().is_empty());
}
