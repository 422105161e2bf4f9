//! Wall-clock helpers. All store timestamps are milliseconds since the Unix epoch.

use chrono::Utc;

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds remaining until `due`, never negative.
pub fn millis_until(due: i64) -> u64 {
    (due - now_ms()).max(0) as u64
}
