//! Reconnect pacing helpers shared by the capture backends.

use std::time::Duration;

/// Capped linear backoff: starts at `initial`, grows by `step` per retry,
/// never exceeds `cap`. The Media Foundation backend uses 1 s / +1 s / 5 s.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    initial: Duration,
    step: Duration,
    cap: Duration,
    current: Duration,
}

impl RetryBackoff {
    #[must_use]
    pub fn new(initial: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            initial,
            step,
            cap,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.cap);
        delay
    }

    /// Call after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Counts consecutive failures; one success clears it. Kept separate from
/// the monotonic dropped-frame total on purpose.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorStreak {
    count: u32,
}

impl ErrorStreak {
    pub fn failure(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub fn success(&mut self) {
        self.count = 0;
    }

    #[must_use]
    pub fn exceeds(&self, limit: u32) -> bool {
        self.count > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_limit() {
        let mut b = RetryBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 3, 4, 5, 5, 5]);
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
    }

    #[test]
    fn streak_resets_on_success() {
        let mut streak = ErrorStreak::default();
        for _ in 0..11 {
            streak.failure();
        }
        assert!(streak.exceeds(10));
        streak.success();
        assert!(!streak.exceeds(0));
    }
}
