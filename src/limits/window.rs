//! UTC window boundaries
//!
//! Every quota resets on an exact UTC boundary: the top of the hour,
//! midnight, or the first of the month.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};

pub fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

pub fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    hour_start(now) + TimeDelta::hours(1)
}

pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now)
}

pub fn next_day(now: DateTime<Utc>) -> DateTime<Utc> {
    day_start(now) + TimeDelta::days(1)
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    first_of_month(now.year(), now.month()).unwrap_or(now)
}

pub fn next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    first_of_month(year, month).unwrap_or(now)
}

/// `YYYY-MM` of the UTC month containing `now`
pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

fn first_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}
