//! File and environment configuration.
//!
//! [`Settings`] gathers everything needed to run a queue, its workers and
//! its scheduler. Values come from defaults, then an optional TOML file,
//! then `KAIROS_*` environment variables (a `.env` file is honoured).
//!
//! ```toml
//! redis_url = "redis://localhost:6379"
//! queue_name = "emails"
//! timezone = "Asia/Kolkata"
//!
//! [worker]
//! concurrency = 5
//! rate_limit = { max = 100, window_ms = 1000 }
//!
//! [default_retry]
//! max_attempts = 3
//! backoff = { type = "exponential", delay = 1000 }
//!
//! [retention.completed]
//! age = 86400
//! count = 1000
//! ```

use crate::backoff::{BackoffKind, BackoffPolicy};
use crate::error::{QueueError, QueueResult};
use crate::job::DEFAULT_MAX_ATTEMPTS;
use crate::queue::QueueConfig;
use crate::retention::RetentionConfig;
use crate::scheduler::SchedulerConfig;
use crate::worker::{RateLimit, WorkerConfig};
use kairos_cron::parse_timezone;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Worker section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_ms: u64,
    pub job_timeout_ms: Option<u64>,
    pub rate_limit: Option<RateLimitSettings>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let config = WorkerConfig::default();
        Self {
            concurrency: config.concurrency,
            poll_interval_ms: millis(config.poll_interval),
            lease_ms: millis(config.lease_duration),
            job_timeout_ms: config.job_timeout.map(millis),
            rate_limit: None,
        }
    }
}

/// Rate limit of the worker section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max: u64,
    pub window_ms: u64,
}

/// Scheduler section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_ms: u64,
    pub promote_batch: usize,
    pub retention_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            tick_ms: millis(config.tick_interval),
            promote_batch: config.promote_batch,
            retention_interval_ms: millis(config.retention_interval),
        }
    }
}

/// Default retry of jobs that do not set their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Redis connection URL
    pub redis_url: String,
    /// Queue name
    pub queue_name: String,
    /// Key prefix override (default `kairos:queue:{queue_name}`)
    pub key_prefix: Option<String>,
    /// Default cron timezone (IANA name)
    pub timezone: String,
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub default_retry: RetrySettings,
    pub retention: RetentionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "default".to_string(),
            key_prefix: None,
            timezone: "UTC".to_string(),
            worker: WorkerSettings::default(),
            scheduler: SchedulerSettings::default(),
            default_retry: RetrySettings::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> QueueResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QueueError::Config(format!("invalid value for {}: {:?}", name, value)))
}

impl Settings {
    /// Parse settings from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> QueueResult<Self> {
        toml::from_str(content).map_err(|e| QueueError::Config(e.to_string()))
    }

    /// Read settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded queue settings file");
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by the environment (after loading `.env`).
    pub fn from_env() -> QueueResult<Self> {
        Self::load(None::<&Path>)
    }

    /// Optional TOML file, then the environment (after loading `.env`).
    pub fn load(path: Option<impl AsRef<Path>>) -> QueueResult<Self> {
        dotenvy::dotenv().ok(); // Ignore if .env doesn't exist

        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `KAIROS_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(url) = var("KAIROS_REDIS_URL").or_else(|| var("REDIS_URL")) {
            self.redis_url = url;
        }
        if let Some(name) = var("KAIROS_QUEUE_NAME") {
            self.queue_name = name;
        }
        if let Some(prefix) = var("KAIROS_KEY_PREFIX") {
            self.key_prefix = Some(prefix);
        }
        if let Some(tz) = var("KAIROS_TIMEZONE") {
            self.timezone = tz;
        }
        if let Some(v) = var("KAIROS_CONCURRENCY") {
            self.worker.concurrency = parse_var("KAIROS_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("KAIROS_LEASE_MS") {
            self.worker.lease_ms = parse_var("KAIROS_LEASE_MS", &v)?;
        }
        if let Some(v) = var("KAIROS_JOB_TIMEOUT_MS") {
            self.worker.job_timeout_ms = Some(parse_var("KAIROS_JOB_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("KAIROS_TICK_MS") {
            self.scheduler.tick_ms = parse_var("KAIROS_TICK_MS", &v)?;
        }

        match (var("KAIROS_RATE_LIMIT_MAX"), var("KAIROS_RATE_LIMIT_WINDOW_MS")) {
            (Some(max), Some(window)) => {
                self.worker.rate_limit = Some(RateLimitSettings {
                    max: parse_var("KAIROS_RATE_LIMIT_MAX", &max)?,
                    window_ms: parse_var("KAIROS_RATE_LIMIT_WINDOW_MS", &window)?,
                });
            }
            (None, None) => {}
            _ => {
                return Err(QueueError::Config(
                    "KAIROS_RATE_LIMIT_MAX and KAIROS_RATE_LIMIT_WINDOW_MS must be set together"
                        .into(),
                ));
            }
        }

        if let Some(v) = var("KAIROS_MAX_ATTEMPTS") {
            self.default_retry.max_attempts = parse_var("KAIROS_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("KAIROS_BACKOFF_TYPE") {
            self.default_retry.backoff.kind = match v.trim().to_ascii_lowercase().as_str() {
                "fixed" => BackoffKind::Fixed,
                "exponential" => BackoffKind::Exponential,
                _ => {
                    return Err(QueueError::Config(format!(
                        "invalid value for KAIROS_BACKOFF_TYPE: {:?}",
                        v
                    )));
                }
            };
        }
        if let Some(v) = var("KAIROS_BACKOFF_DELAY_MS") {
            self.default_retry.backoff.base_delay =
                Duration::from_millis(parse_var("KAIROS_BACKOFF_DELAY_MS", &v)?);
        }

        Ok(self)
    }

    /// Queue configuration.
    pub fn queue_config(&self) -> QueueResult<QueueConfig> {
        let timezone = parse_timezone(&self.timezone)?;
        let mut config = QueueConfig::new(self.redis_url.clone(), self.queue_name.clone())
            .with_default_retry(self.default_retry.max_attempts, self.default_retry.backoff)
            .with_retention(self.retention)
            .with_timezone(timezone);
        if let Some(prefix) = &self.key_prefix {
            config = config.with_key_prefix(prefix.clone());
        }
        Ok(config)
    }

    /// Worker configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker.concurrency,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            lease_duration: Duration::from_millis(self.worker.lease_ms),
            job_timeout: self.worker.job_timeout_ms.map(Duration::from_millis),
            rate_limit: self.worker.rate_limit.map(|limit| RateLimit {
                max: limit.max,
                window: Duration::from_millis(limit.window_ms),
            }),
            ..WorkerConfig::default()
        }
    }

    /// Scheduler configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler.tick_ms),
            promote_batch: self.scheduler.promote_batch,
            retention_interval: Duration::from_millis(self.scheduler.retention_interval_ms),
            ..SchedulerConfig::default()
        }
    }
}
