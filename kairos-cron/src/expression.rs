//! Cron expression parsing and evaluation.

use crate::error::{CronError, CronResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: Schedule,
    expression: String,
}

impl CronExpression {
    /// Parse a cron expression.
    ///
    /// Accepts the classic five-field crontab format
    /// (`minute hour day-of-month month day-of-week`, Sunday = 0 or 7) as well
    /// as the six/seven field format with a leading seconds column
    /// (and optional trailing year).
    ///
    /// # Examples
    ///
    /// ```
    /// use kairos_cron::CronExpression;
    ///
    /// // Top of every hour, crontab style
    /// let hourly = CronExpression::parse("0 * * * *").unwrap();
    ///
    /// // Every Monday at 9 AM, with seconds
    /// let monday = CronExpression::parse("0 0 9 * * MON").unwrap();
    ///
    /// assert_eq!(hourly.expression(), "0 * * * *");
    /// assert_eq!(monday.expression(), "0 0 9 * * MON");
    /// ```
    pub fn parse(expression: &str) -> CronResult<Self> {
        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;

        Ok(Self {
            schedule,
            expression: expression.trim().to_string(),
        })
    }

    /// Get the next execution time strictly after `after`, evaluated in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_in(after, Tz::UTC)
    }

    /// Get the next execution time strictly after `after`, with the fields
    /// interpreted as wall-clock time in `tz`.
    pub fn next_after_in(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t > after)
    }

    /// Get the expression string as supplied by the caller.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Bring a crontab-style expression into the seconds-first form understood by
/// the `cron` crate.
fn normalize(expression: &str) -> CronResult<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = shift_weekday_field(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CronError::InvalidExpression(format!(
            "{}: expected 5, 6 or 7 fields, found {}",
            expression, n
        ))),
    }
}

/// Crontab numbers weekdays 0-7 with Sunday as 0 and 7; the `cron` crate uses
/// 1-7 with Sunday as 1. Numeric ranges and steps are expanded into explicit
/// day lists, since shifting them cannot express a range that runs into
/// Sunday. Names and wildcards pass through untouched.
fn shift_weekday_field(field: &str) -> String {
    field
        .split(',')
        .map(|item| match crontab_weekdays(item) {
            Some(days) => days
                .iter()
                .map(|day| (day % 7 + 1).to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
                .join(","),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Crontab days (0-7) selected by one numeric list item such as `3`, `1-5`
/// or `1-7/2`. `None` for names, wildcards and anything malformed.
fn crontab_weekdays(item: &str) -> Option<Vec<u8>> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, step.parse::<u8>().ok().filter(|s| *s > 0)?),
        None => (item, 1),
    };
    let (start, end) = match base.split_once('-') {
        Some((start, end)) => (start.parse::<u8>().ok()?, end.parse::<u8>().ok()?),
        // `N/step` runs to the end of the week
        None if item.contains('/') => (base.parse::<u8>().ok()?, 7),
        None => {
            let day = base.parse::<u8>().ok()?;
            (day, day)
        }
    };
    if start > end || end > 7 {
        return None;
    }
    Some((start..=end).step_by(usize::from(step)).collect())
}

/// Parse an IANA timezone name such as `Asia/Kolkata`.
pub fn parse_timezone(name: &str) -> CronResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}
