use std::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// The retry policy the forwarder uses to survive transient transport errors.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Always at least 1.
    max_attempts: u32,
    /// Upper bound on the duration of a single attempt.
    per_attempt_timeout: time::Duration,
    /// Coefficient to multiply initial_backoff with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_backoff: time::Duration,
    /// The maximum possible backoff between retries.
    max_backoff: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        per_attempt_timeout: time::Duration,
        initial_backoff: time::Duration,
        max_backoff: time::Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
            backoff_coefficient: 2,
            initial_backoff,
            max_backoff,
        }
    }

    /// Build a policy from a number of retries following the first attempt.
    pub fn from_retry_count(
        retry_count: u32,
        per_attempt_timeout: time::Duration,
        initial_backoff: time::Duration,
        max_backoff: time::Duration,
    ) -> Self {
        Self::new(
            retry_count.saturating_add(1),
            per_attempt_timeout,
            initial_backoff,
            max_backoff,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn per_attempt_timeout(&self) -> time::Duration {
        self.per_attempt_timeout
    }

    /// Whether another attempt may follow the given (1-based) attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the time to wait after the given (1-based) failed attempt.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff);

        std::cmp::min(candidate_interval, self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            per_attempt_timeout: time::Duration::from_secs(10),
            backoff_coefficient: 2,
            initial_backoff: time::Duration::from_secs(5),
            max_backoff: time::Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_until_capped() {
        let policy = RetryPolicy::new(
            10,
            time::Duration::from_secs(1),
            time::Duration::from_millis(100),
            time::Duration::from_millis(1000),
        );

        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(2), time::Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(3), time::Duration::from_millis(400));
        assert_eq!(policy.time_until_next_retry(4), time::Duration::from_millis(800));
        assert_eq!(policy.time_until_next_retry(5), time::Duration::from_millis(1000));
        assert_eq!(policy.time_until_next_retry(64), time::Duration::from_millis(1000));
    }

    #[test]
    fn test_attempts() {
        let policy = RetryPolicy::from_retry_count(
            2,
            time::Duration::from_secs(3),
            time::Duration::from_secs(5),
            time::Duration::from_secs(7),
        );

        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.per_attempt_timeout(), time::Duration::from_secs(3));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::new(
            0,
            time::Duration::from_secs(1),
            time::Duration::from_secs(1),
            time::Duration::from_secs(1),
        );

        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1));
    }
}
