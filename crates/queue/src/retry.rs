use std::time::Duration;

/// Per-job retry policy with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay after a failure, given the number of attempts already retried.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether the attempt that just failed was the last one allowed.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(10));
        assert_eq!(p.delay_for(1), Duration::from_secs(20));
        assert_eq!(p.delay_for(2), Duration::from_secs(40));
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(3), Duration::from_secs(60));
        assert_eq!(p.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_exhaustion_counts_the_first_attempt() {
        let p = policy();
        assert!(!p.is_exhausted(0));
        assert!(!p.is_exhausted(2));
        assert!(p.is_exhausted(3));
        assert!(p.is_exhausted(10));
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let p = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        assert!(p.is_exhausted(0));
    }
}
