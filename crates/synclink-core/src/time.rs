//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds in one UTC day.
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Start of the UTC day containing `ms`.
#[must_use]
pub fn start_of_day(ms: u64) -> u64 {
    ms - ms % DAY_MS
}
