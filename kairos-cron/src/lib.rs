//! Cron expressions for Kairos recurring jobs.
//!
//! Parses crontab-style (five field) and seconds-first (six/seven field)
//! expressions and evaluates the next occurrence in any IANA timezone.
//!
//! ```
//! use kairos_cron::{CronExpression, parse_timezone};
//! use chrono::{TimeZone, Utc};
//!
//! let expr = CronExpression::parse("30 2 * * *").unwrap();
//! let tz = parse_timezone("Europe/Berlin").unwrap();
//!
//! let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
//! let next = expr.next_after_in(now, tz).unwrap();
//!
//! // 02:30 Berlin summer time is 00:30 UTC
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 0, 30, 0).unwrap());
//! ```

pub mod error;
pub mod expression;

pub use chrono_tz::Tz;
pub use error::{CronError, CronResult};
pub use expression::{CronExpression, parse_timezone};
