//! Reschedule delays.
//!
//! Periodic jobs of many entities share the same cadence; every delay gets a
//! random jitter so their runs spread out instead of firing together.

use std::time::Duration;

use rand::Rng;

/// Lower bound of the event-polling interval, in seconds.
pub const EVENTS_MIN_DELAY: u64 = 60;
/// Exclusive upper bound of the jitter added to the polling interval.
pub const EVENTS_JITTER: u64 = 10;

/// Interval between two hook checks, in seconds.
pub const HOOK_CHECK_DELAY: u64 = 13 * 60;
/// Exclusive upper bound of the jitter added to the hook-check interval.
pub const HOOK_CHECK_JITTER: u64 = 240;

/// Margin added to a rate-limit TTL before resetting a token again.
pub const TOKEN_RESET_MARGIN: u64 = 2;
/// Assumed rate-limit window, in seconds, when the service gives no reset time.
pub const RATE_LIMIT_FALLBACK: u64 = 60;

fn jitter<R: Rng>(rng: &mut R, max_exclusive: u64) -> u64 {
    if max_exclusive == 0 {
        return 0;
    }
    rng.gen_range(0..max_exclusive)
}

/// `max(suggested, 60) + [0, 10)` seconds.
pub fn events_poll_delay<R: Rng>(suggested_delay: Option<u64>, rng: &mut R) -> Duration {
    let base = suggested_delay.unwrap_or(0).max(EVENTS_MIN_DELAY);
    Duration::from_secs(base + jitter(rng, EVENTS_JITTER))
}

/// `13 min + [0, 240)` seconds.
pub fn hook_check_delay<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_secs(HOOK_CHECK_DELAY + jitter(rng, HOOK_CHECK_JITTER))
}

/// `ttl + 2` seconds; a missing counter counts as an expired one.
pub fn token_reset_delay(rate_limit_ttl: Option<u64>) -> Duration {
    Duration::from_secs(rate_limit_ttl.unwrap_or(0) + TOKEN_RESET_MARGIN)
}
