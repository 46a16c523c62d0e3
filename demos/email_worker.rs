//! Email and maintenance worker.
//!
//! Enqueues immediate, delayed, scheduled and recurring jobs, then runs a
//! scheduler and a worker pool against them while printing lifecycle events.
//!
//! Requires Redis at `redis://localhost:6379` (override with `KAIROS_REDIS_URL`).
//!
//! ```text
//! RUST_LOG=info cargo run --example email_worker
//! ```

use kairos::*;
use serde_json::json;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), QueueError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load(None::<&str>)?;
    let config = settings.queue_config()?;
    let queue = Queue::connect(config.clone()).await?;
    info!(queue = %queue.name(), "Connected");

    let events = RedisEventBus::connect(&config.redis_url, config.events_channel()).await?;
    let mut stream = events.subscribe().await?;
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            info!(event = event.kind(), job_id = %event.job_id(), "Queue event");
        }
    });

    let mut handlers = HandlerRegistry::new();
    handlers
        .register("process-job", |job: Job| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(json!({ "processed": true, "input": job.payload }))
        })
        .register("email-notification", |job: Job| async move {
            let Some(to) = job.payload["to"].as_str() else {
                return Err(QueueError::unrecoverable("missing recipient"));
            };
            info!(to = to, attempt = job.attempts_made + 1, "Sending email");
            if job.payload["flaky"].as_bool().unwrap_or(false) && job.attempts_made < 2 {
                return Err(QueueError::execution("smtp connection reset"));
            }
            Ok(json!({ "sent": true }))
        })
        .register("data-cleanup", |job: Job| async move {
            info!(table = %job.payload["table"], "Cleaning up");
            Ok(json!({ "cleaned": true }))
        });

    queue
        .enqueue("process-job", json!({ "report": "daily" }), JobOptions::new())
        .await?;
    queue
        .enqueue(
            "email-notification",
            json!({ "to": "user@example.com" }),
            JobOptions::delay(Duration::from_secs(5)),
        )
        .await?;
    queue
        .enqueue(
            "email-notification",
            json!({ "to": "ops@example.com", "flaky": true }),
            JobOptions::new().backoff(BackoffPolicy::exponential(Duration::from_millis(500))),
        )
        .await?;
    queue
        .enqueue(
            "email-notification",
            json!({ "to": "later@example.com" }),
            JobOptions::at(chrono::Utc::now() + chrono::Duration::seconds(10)),
        )
        .await?;

    let every_few_seconds = ScheduleSpec::every(Duration::from_secs(4)).with_limit(3);
    match queue
        .enqueue(
            "data-cleanup",
            json!({ "table": "sessions" }),
            JobOptions::with_schedule(every_few_seconds),
        )
        .await
    {
        Ok(job) => info!(job_id = %job.id, "Registered interval cleanup"),
        Err(QueueError::DuplicateSeries(key)) => info!(key = %key, "Interval cleanup already registered"),
        Err(e) => return Err(e),
    }

    let nightly = ScheduleSpec::cron("0 3 * * *");
    match queue
        .enqueue("data-cleanup", json!({ "table": "audit_log" }), JobOptions::with_schedule(nightly))
        .await
    {
        Ok(job) => info!(job_id = %job.id, run_at = %job.run_at, "Registered nightly cleanup"),
        Err(QueueError::DuplicateSeries(key)) => info!(key = %key, "Nightly cleanup already registered"),
        Err(e) => return Err(e),
    }

    let mut scheduler = Scheduler::with_config(queue.clone(), settings.scheduler_config());
    let mut worker = Worker::with_config(queue.clone(), handlers, settings.worker_config())?;
    scheduler.start().await?;
    worker.start().await?;

    tokio::time::sleep(Duration::from_secs(20)).await;

    worker.stop().await?;
    scheduler.stop().await?;

    for series in queue.list_recurring().await? {
        info!(key = %series.key, produced = series.produced, next = %series.latest_run_at, "Recurring series");
    }
    Ok(())
}
