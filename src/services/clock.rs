//! Time source shared by the caches.
//!
//! Ages are measured on wall-clock UTC timestamps so the same value can be
//! reported to clients (`fetched_at`) and compared against a TTL.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Utc::now()`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests to cross TTL boundaries.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// True while `stamped_at` is younger than `ttl` as of `now`.
///
/// A timestamp in the future (clock skew) counts as fresh.
pub fn is_fresh(stamped_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now.signed_duration_since(stamped_at) < ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_until_ttl_elapses() {
        let clock = ManualClock::default();
        let stamped = clock.now();
        let ttl = Duration::seconds(60);

        assert!(is_fresh(stamped, clock.now(), ttl));

        clock.advance(Duration::seconds(59));
        assert!(is_fresh(stamped, clock.now(), ttl));

        // Age == TTL is already expired
        clock.advance(Duration::seconds(1));
        assert!(!is_fresh(stamped, clock.now(), ttl));
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let now = Utc::now();
        assert!(is_fresh(now + Duration::seconds(5), now, Duration::seconds(1)));
    }
}
