use std::ops::Range;
use std::time::Duration;

use rand::Rng;

pub const MAX_BACKOFF_MS: u64 = 60_000;

/// `[c^3, (c+1)^3)` milliseconds for `c` continuous errors, or `None` when there were none.
pub fn backoff_window(continuous_errors: u64) -> Option<Range<u64>> {
    if continuous_errors == 0 {
        return None;
    }
    let low = continuous_errors.saturating_pow(3);
    let high = continuous_errors.saturating_add(1).saturating_pow(3);
    Some(low..high.max(low.saturating_add(1)))
}

pub fn backoff_delay(continuous_errors: u64) -> Duration {
    let Some(window) = backoff_window(continuous_errors) else {
        return Duration::ZERO;
    };
    if window.start >= MAX_BACKOFF_MS {
        return Duration::from_millis(MAX_BACKOFF_MS);
    }
    let millis = rand::rng().random_range(window);
    Duration::from_millis(millis.min(MAX_BACKOFF_MS))
}
