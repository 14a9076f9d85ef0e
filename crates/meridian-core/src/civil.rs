//! Civil-time rules for period keys and TTL alignment
//!
//! All quota periods are computed in a fixed zone (Asia/Singapore):
//! days roll at local midnight, weeks at ISO Monday 00:00. Counter
//! expiry is aligned to these boundaries so windows reset implicitly
//! by TTL, never by a scheduled job.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Asia::Singapore;
use chrono_tz::Tz;

/// The zone every period boundary is computed in
pub const ZONE: Tz = Singapore;

/// Current civil time in the fixed zone
pub fn now() -> DateTime<Tz> {
    Utc::now().with_timezone(&ZONE)
}

/// Current unix timestamp in seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Day period key, `YYYY-MM-DD`
pub fn day_key(at: DateTime<Tz>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// ISO week period key, `YYYY-Www`
pub fn week_key(at: DateTime<Tz>) -> String {
    let iso = at.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

/// Time remaining until the next local midnight
pub fn until_midnight(at: DateTime<Tz>) -> Duration {
    match at.date_naive().succ_opt().and_then(local_midnight) {
        Some(boundary) => to_std(boundary - at),
        // unreachable for any realistic date; fall back to a full day
        None => Duration::from_secs(24 * 3600),
    }
}

/// Time remaining until the next ISO Monday 00:00
pub fn until_next_monday(at: DateTime<Tz>) -> Duration {
    let days_ahead = 7 - i64::from(at.weekday().num_days_from_monday());
    let target = at
        .date_naive()
        .checked_add_days(chrono::Days::new(days_ahead as u64))
        .and_then(local_midnight);
    match target {
        Some(boundary) => to_std(boundary - at),
        None => Duration::from_secs(7 * 24 * 3600),
    }
}

fn local_midnight(date: NaiveDate) -> Option<DateTime<Tz>> {
    // Singapore has no DST; midnight always exists and is unambiguous
    ZONE.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).earliest()
}

fn to_std(delta: chrono::TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::from_secs(1))
}
