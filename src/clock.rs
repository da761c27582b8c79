//! Millisecond-epoch time helpers.
//!
//! Timestamps are unix-epoch milliseconds (`i64`) in the database and on the
//! wire; calendar math goes through `chrono` in UTC.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC datetime. Out-of-range values clamp to
/// the epoch rather than panic.
pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Calendar date (UTC) of a millisecond timestamp.
pub fn date_of(ms: i64) -> NaiveDate {
    to_datetime(ms).date_naive()
}

/// Time of day (UTC) of a millisecond timestamp.
pub fn time_of(ms: i64) -> NaiveTime {
    to_datetime(ms).time()
}

/// Epoch milliseconds of a calendar date at a given time of day (UTC).
pub fn at(date: NaiveDate, time: NaiveTime) -> i64 {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Half-open `[start, end)` millisecond bounds of the calendar day containing
/// the given timestamp.
pub fn day_bounds(ms: i64) -> (i64, i64) {
    let start = at(date_of(ms), NaiveTime::MIN);
    (start, start + DAY_MS)
}
