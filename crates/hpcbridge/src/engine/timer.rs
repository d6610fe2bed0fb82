use std::time::{Duration, Instant};

use crate::common::timeutils::now_monotonic;

/// Tracks when a periodic action was last performed.
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: now_monotonic(),
        }
    }

    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last) >= interval
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }

    /// Time left until the action is due again.
    pub fn remaining(&self, now: Instant, interval: Duration) -> Duration {
        (self.last + interval).saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::TickTimer;
    use crate::common::timeutils::mock_time::MockTime;

    #[test]
    fn due_after_interval() {
        let start = Instant::now();
        let _mock = MockTime::mock(start);
        let mut timer = TickTimer::new();
        let interval = Duration::from_secs(60);

        assert!(!timer.is_due(start + Duration::from_secs(59), interval));
        assert!(timer.is_due(start + Duration::from_secs(60), interval));
        assert_eq!(
            timer.remaining(start + Duration::from_secs(45), interval),
            Duration::from_secs(15)
        );
        assert_eq!(
            timer.remaining(start + Duration::from_secs(75), interval),
            Duration::ZERO
        );

        timer.reset(start + Duration::from_secs(75));
        assert!(!timer.is_due(start + Duration::from_secs(100), interval));
    }

    #[test]
    fn zero_interval_is_always_due() {
        let start = Instant::now();
        let _mock = MockTime::mock(start);
        let timer = TickTimer::new();
        assert!(timer.is_due(start, Duration::ZERO));
    }
}
