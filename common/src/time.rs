// Time helpers. Timestamps recorded here are informational (settime,
// logging); nothing consensus-critical derives from the local clock.

use crate::config::COMPAT_DATETIME_FORMAT;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

#[inline]
pub fn get_current_time() -> Duration {
    let start = SystemTime::now();

    start
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from get_current_time")
}

// Return timestamp in milliseconds
// We cast it to u64 as we have plenty of time before it overflows
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}

// Locale style datetime string, kept for compatibility with clients that
// post with `compatDateTime` set
pub fn format_compat_datetime(millis: TimestampMillis) -> String {
    let dt = chrono::DateTime::from_timestamp_millis(millis as i64)
        .unwrap_or_else(chrono::Utc::now);
    dt.with_timezone(&chrono::Local)
        .format(COMPAT_DATETIME_FORMAT)
        .to_string()
}
