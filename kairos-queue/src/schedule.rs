//! Timing directives for enqueued jobs.
//!
//! A [`ScheduleSpec`] says when a job first becomes eligible. Recurring specs
//! also produce a [`Recurrence`], the rule the series follows after each
//! instance finishes, and a [`RepeatSeries`] record in the store.

use crate::backoff::BackoffPolicy;
use crate::duration::to_chrono;
use crate::error::{QueueError, QueueResult};
use crate::job::{JobData, JobId, JobState};
use crate::retention::RetentionConfig;
use chrono::{DateTime, Utc};
use kairos_cron::{CronExpression, Tz, parse_timezone};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a job should run.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScheduleSpec {
    /// Eligible right away
    #[default]
    Immediate,
    /// Eligible after a delay (a zero delay is immediate)
    Delay(Duration),
    /// Eligible at a fixed instant, which must not be in the past
    At(DateTime<Utc>),
    /// Repeats every `every`, at most `limit` instances
    Interval { every: Duration, limit: Option<u32> },
    /// Repeats on a cron expression in `timezone` (queue default if unset)
    Cron {
        expression: String,
        timezone: Option<String>,
        limit: Option<u32>,
    },
}

/// First run of a schedule, as decided at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedSchedule {
    pub run_at: DateTime<Utc>,
    pub state: JobState,
    pub recurrence: Option<Recurrence>,
}

impl ScheduleSpec {
    /// Repeat every `every` with no limit.
    pub fn every(every: Duration) -> Self {
        Self::Interval { every, limit: None }
    }

    /// Repeat on a cron expression in the queue's default timezone.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
            limit: None,
        }
    }

    /// Cap a recurring schedule at `limit` instances. No effect on one-shot
    /// schedules.
    pub fn with_limit(mut self, max: u32) -> Self {
        match &mut self {
            Self::Interval { limit, .. } | Self::Cron { limit, .. } => *limit = Some(max),
            _ => {}
        }
        self
    }

    /// Set the timezone of a cron schedule. No effect on other schedules.
    pub fn in_timezone(mut self, tz: impl Into<String>) -> Self {
        if let Self::Cron { timezone, .. } = &mut self {
            *timezone = Some(tz.into());
        }
        self
    }

    /// Whether the schedule produces a series.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Interval { .. } | Self::Cron { .. })
    }

    /// Validate the schedule and build its recurrence rule, if any.
    pub fn recurrence(&self, default_tz: Tz) -> QueueResult<Option<Recurrence>> {
        match self {
            Self::Interval { every, limit } => {
                if every.is_zero() {
                    return Err(QueueError::InvalidSchedule(
                        "repeat interval must be greater than zero".into(),
                    ));
                }
                check_limit(*limit)?;
                Ok(Some(Recurrence::Interval {
                    every: *every,
                    limit: *limit,
                }))
            }
            Self::Cron {
                expression,
                timezone,
                limit,
            } => {
                check_limit(*limit)?;
                let parsed = CronExpression::parse(expression)
                    .map_err(|e| QueueError::InvalidSchedule(e.to_string()))?;
                let tz = match timezone {
                    Some(name) => {
                        parse_timezone(name).map_err(|e| QueueError::InvalidSchedule(e.to_string()))?
                    }
                    None => default_tz,
                };
                Ok(Some(Recurrence::Cron {
                    expression: parsed.expression().to_string(),
                    timezone: tz.name().to_string(),
                    limit: *limit,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Decide the first `run_at` and initial state.
    pub(crate) fn resolve(&self, now: DateTime<Utc>, default_tz: Tz) -> QueueResult<ResolvedSchedule> {
        let one_shot = |run_at: DateTime<Utc>, state: JobState| ResolvedSchedule {
            run_at,
            state,
            recurrence: None,
        };

        match self {
            Self::Immediate => Ok(one_shot(now, JobState::Waiting)),
            Self::Delay(delay) if delay.is_zero() => Ok(one_shot(now, JobState::Waiting)),
            Self::Delay(delay) => Ok(one_shot(now + to_chrono(*delay), JobState::Delayed)),
            Self::At(at) if *at < now => Err(QueueError::InvalidSchedule(format!(
                "schedule time {} is in the past",
                at.to_rfc3339()
            ))),
            Self::At(at) => Ok(one_shot(*at, JobState::Delayed)),
            Self::Interval { .. } | Self::Cron { .. } => {
                let recurrence = self.recurrence(default_tz)?.ok_or_else(|| {
                    QueueError::InvalidSchedule("recurring schedule without a rule".into())
                })?;
                let run_at = recurrence.next_after(now)?;
                Ok(ResolvedSchedule {
                    run_at,
                    state: JobState::Delayed,
                    recurrence: Some(recurrence),
                })
            }
        }
    }
}

fn check_limit(limit: Option<u32>) -> QueueResult<()> {
    if limit == Some(0) {
        return Err(QueueError::InvalidSchedule(
            "repeat limit must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Rule a recurring series follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Recurrence {
    /// Fixed interval
    Interval {
        #[serde(with = "crate::duration::millis")]
        every: Duration,
        limit: Option<u32>,
    },
    /// Cron expression evaluated in an IANA timezone
    Cron {
        expression: String,
        timezone: String,
        limit: Option<u32>,
    },
}

impl Recurrence {
    /// Maximum number of instances.
    pub fn limit(&self) -> Option<u32> {
        match self {
            Recurrence::Interval { limit, .. } | Recurrence::Cron { limit, .. } => *limit,
        }
    }

    /// Next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> QueueResult<DateTime<Utc>> {
        match self {
            Recurrence::Interval { every, .. } => Ok(after + to_chrono(*every)),
            Recurrence::Cron {
                expression,
                timezone,
                ..
            } => {
                let tz = parse_timezone(timezone)?;
                CronExpression::parse(expression)?
                    .next_after_in(after, tz)
                    .ok_or_else(|| {
                        QueueError::InvalidSchedule(format!(
                            "cron expression {} has no upcoming occurrence",
                            expression
                        ))
                    })
            }
        }
    }

    /// Registry key of the series this rule forms with `name`.
    ///
    /// The limit is not part of the key: one name and timing form one series.
    pub fn series_key(&self, name: &str) -> String {
        match self {
            Recurrence::Interval { every, .. } => format!("{}:every:{}", name, every.as_millis()),
            Recurrence::Cron {
                expression,
                timezone,
                ..
            } => format!("{}:cron:{}:{}", name, expression, timezone),
        }
    }
}

/// Registry record of a recurring series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSeries {
    /// Series key (name plus canonical timing)
    pub key: String,

    /// Handler name of every instance
    pub name: String,

    /// Payload copied into every instance
    pub payload: JobData,

    /// Timing rule
    pub recurrence: Recurrence,

    /// Retry ceiling of every instance
    pub max_attempts: u32,

    /// Backoff of every instance
    pub backoff: BackoffPolicy,

    /// Retention of every instance
    pub retention: RetentionConfig,

    /// Instances created so far
    pub produced: u32,

    /// Scheduled `run_at` of the latest instance
    pub latest_run_at: DateTime<Utc>,

    /// Id of the latest instance
    pub latest_job: JobId,

    /// When the series was registered
    pub created_at: DateTime<Utc>,
}

impl RepeatSeries {
    /// Whether the series may not produce another instance.
    pub fn limit_reached(&self) -> bool {
        self.recurrence
            .limit()
            .is_some_and(|limit| self.produced >= limit)
    }
}

/// Loose request shape accepted from callers that build schedules from
/// untyped input (JSON bodies, CLI flags).
///
/// At most one of `delay`, `scheduleTime` and `repeat` may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    /// Delay in milliseconds
    #[serde(default)]
    pub delay: Option<u64>,

    /// Fixed run time
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,

    /// Recurrence
    #[serde(default)]
    pub repeat: Option<RepeatRequest>,
}

/// Recurrence part of a [`ScheduleRequest`]. Exactly one of `every` and
/// `cron` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatRequest {
    /// Interval in milliseconds
    #[serde(default)]
    pub every: Option<u64>,

    /// Cron expression
    #[serde(default, alias = "pattern")]
    pub cron: Option<String>,

    /// Maximum number of instances
    #[serde(default)]
    pub limit: Option<u32>,

    /// IANA timezone of the cron expression
    #[serde(default, alias = "timezone")]
    pub tz: Option<String>,
}

impl TryFrom<ScheduleRequest> for ScheduleSpec {
    type Error = QueueError;

    fn try_from(request: ScheduleRequest) -> Result<Self, Self::Error> {
        let given = [
            request.delay.is_some(),
            request.schedule_time.is_some(),
            request.repeat.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        if given > 1 {
            return Err(QueueError::InvalidSchedule(
                "ambiguous schedule: set only one of delay, scheduleTime and repeat".into(),
            ));
        }

        if let Some(delay) = request.delay {
            return Ok(ScheduleSpec::Delay(Duration::from_millis(delay)));
        }
        if let Some(at) = request.schedule_time {
            return Ok(ScheduleSpec::At(at));
        }
        let Some(repeat) = request.repeat else {
            return Ok(ScheduleSpec::Immediate);
        };

        match (repeat.every, repeat.cron) {
            (Some(every), None) => {
                if repeat.tz.is_some() {
                    return Err(QueueError::InvalidSchedule(
                        "a timezone only applies to cron repeats".into(),
                    ));
                }
                Ok(ScheduleSpec::Interval {
                    every: Duration::from_millis(every),
                    limit: repeat.limit,
                })
            }
            (None, Some(expression)) => Ok(ScheduleSpec::Cron {
                expression,
                timezone: repeat.tz,
                limit: repeat.limit,
            }),
            (Some(_), Some(_)) => Err(QueueError::InvalidSchedule(
                "ambiguous repeat: set either every or cron, not both".into(),
            )),
            (None, None) => Err(QueueError::InvalidSchedule(
                "repeat needs every or cron".into(),
            )),
        }
    }
}
