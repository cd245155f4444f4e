use std::time::Duration;

/// Exponential backoff policy: `base * 2^attempt`, never below a server hint,
/// never above `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    /// 5 s base, one hour ceiling.
    fn default() -> Self {
        Self::new(5_000, 3_600_000)
    }
}

/// Consecutive-failure counter driving a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn next_delay(&mut self, retry_after_hint_ms: Option<u64>) -> Duration {
        let delay = self
            .policy
            .delay_for_attempt(self.attempt, retry_after_hint_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let policy = RetryPolicy::new(100, 10_000);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::new(1_000, 4_000);
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::new(500, 20_000);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn default_matches_bad_sync_limits() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(), 5_000);
        assert_eq!(policy.max_delay_ms(), 3_600_000);
    }

    #[test]
    fn backoff_doubles_from_five_seconds_and_caps_at_sixty() {
        let mut backoff = Backoff::new(RetryPolicy::new(5_000, 60_000));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay(None).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut backoff = Backoff::new(RetryPolicy::new(5_000, 60_000));
        backoff.next_delay(None);
        backoff.next_delay(None);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(None), Duration::from_secs(5));
    }

    #[test]
    fn max_is_never_below_base() {
        let policy = RetryPolicy::new(2_000, 10);
        assert_eq!(policy.delay_for_attempt(0, None), Duration::from_secs(2));
    }
}
