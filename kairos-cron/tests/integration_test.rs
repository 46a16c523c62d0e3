//! Integration tests for kairos-cron

use chrono::{TimeZone, Utc};
use kairos_cron::*;

#[test]
fn test_cron_expression_parsing() {
    assert!(CronExpression::parse("0 0 * * * *").is_ok());
    assert!(CronExpression::parse("*/15 * * * *").is_ok());
    assert!(CronExpression::parse("invalid").is_err());
}

#[test]
fn test_successive_occurrences() {
    let expr = CronExpression::parse("*/15 * * * *").unwrap();
    let start = Utc.with_ymd_and_hms(2024, 5, 5, 8, 1, 0).unwrap();

    let first = expr.next_after(start).unwrap();
    let second = expr.next_after(first).unwrap();

    assert_eq!(first, Utc.with_ymd_and_hms(2024, 5, 5, 8, 15, 0).unwrap());
    assert_eq!(second, Utc.with_ymd_and_hms(2024, 5, 5, 8, 30, 0).unwrap());
}

#[test]
fn test_weekday_range_in_timezone() {
    // Weekdays at 09:00 New York (EST in January, UTC-5)
    let expr = CronExpression::parse("0 9 * * 1-5").unwrap();
    let tz = parse_timezone("America/New_York").unwrap();

    // Saturday 2024-01-06
    let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
    let next = expr.next_after_in(saturday, tz).unwrap();

    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 14, 0, 0).unwrap());
}

#[test]
fn test_cron_error_display() {
    let err = CronExpression::parse("bad cron").unwrap_err();
    assert!(err.to_string().contains("bad cron"));
}
