//! Midnight-aligned scaling windows.

use std::time::Duration;

const DAY_SECS: i64 = 24 * 3600;

/// First window boundary strictly after `now`.
///
/// Boundaries fall at UTC midnight plus whole multiples of `window`. When
/// `window` does not divide a day, the last window of the day is cut short
/// at the next midnight.
pub fn next_window_boundary(now: i64, window: Duration) -> i64 {
    let midnight = now - now.rem_euclid(DAY_SECS);
    let window = (window.as_secs() as i64).clamp(1, DAY_SECS);
    let into_day = now - midnight;
    let boundary = midnight + (into_day / window + 1) * window;
    boundary.min(midnight + DAY_SECS)
}
