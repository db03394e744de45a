use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Physical clock used for progress-report pacing and install timestamps.
pub trait SystemClock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct DefaultSystemClock {
    last_tick: AtomicI64,
}

impl Default for DefaultSystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultSystemClock {
    pub fn new() -> Self {
        Self {
            last_tick: AtomicI64::new(i64::MIN),
        }
    }
}

impl SystemClock for DefaultSystemClock {
    fn now(&self) -> SystemTime {
        // SystemTime is not guaranteed to be monotonic, so monotonicity is
        // enforced here
        let tick = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        self.last_tick.fetch_max(tick, Ordering::SeqCst);
        let millis = self.last_tick.load(Ordering::SeqCst);
        if millis >= 0 {
            UNIX_EPOCH + Duration::from_millis(millis as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test::TestClock;
    use super::*;

    #[test]
    fn default_clock_never_goes_backwards() {
        let clock = DefaultSystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_clock_only_moves_when_advanced() {
        let clock = TestClock::new();
        let before = clock.now();
        assert_eq!(clock.now(), before);
        clock.ticker.store(5_000, Ordering::SeqCst);
        assert_eq!(
            clock.now().duration_since(before).unwrap(),
            Duration::from_secs(5)
        );
    }
}
