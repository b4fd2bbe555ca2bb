//! Reconnect delay policy.

use std::time::Duration;

/// How long to wait before each reconnect attempt.
///
/// `attempt` counts consecutive failures since the last successful connection,
/// starting at 0. The delay grows by `factor` per attempt up to `max_delay`.
/// With `max_attempts` set, the policy gives up once that many retries have
/// been scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    initial: Duration,
    factor: u32,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Same delay every time, retrying forever.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Delay multiplied by `factor` after each failure, capped at `max_delay`.
    pub fn exponential(initial: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            initial,
            factor,
            max_delay: max_delay.max(initial),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before retry number `attempt`, or `None` once the cap is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return None;
        }
        if self.factor <= 1 {
            return Some(self.initial.min(self.max_delay));
        }

        let mut delay = self.initial;
        for _ in 0..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(self.factor);
        }
        Some(delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_never_changes() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));
        for attempt in [0, 1, 10, u32::MAX] {
            assert_eq!(policy.delay_for(attempt), Some(Duration::from_millis(500)));
        }
    }

    #[test]
    fn exponential_grows_then_caps() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(1), 2, Duration::from_secs(10));
        let delays: Vec<_> = (0..6)
            .map(|a| policy.delay_for(a).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.delay_for(u32::MAX), Some(Duration::from_secs(10)));
    }

    #[test]
    fn max_attempts_exhausts() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(2);
        assert!(policy.delay_for(0).is_some());
        assert!(policy.delay_for(1).is_some());
        assert_eq!(policy.delay_for(2), None);
    }

    #[test]
    fn cap_below_initial_is_raised() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(5), 3, Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(5)));
    }
}
