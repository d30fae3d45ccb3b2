//! Wall-clock helpers.
//!
//! Centralized so the rest of the codebase never calls `SystemTime::now()`
//! directly — keeps every timestamp in the same unit (microseconds since the
//! Unix epoch) and gives us one seam to swap out if a test ever needs to.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time, in microseconds since the Unix epoch.
///
/// Used for `Handle::WorkInProgressTimestamp`, transaction `start_time`, and
/// transaction log modification times.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
