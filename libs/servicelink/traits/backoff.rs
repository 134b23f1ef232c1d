use std::time::Duration;

/// Trait for defining reconnect backoff policies
///
/// Implement this trait to control how the connection container
/// should space out reconnection attempts after a failure.
pub trait BackOffPolicy: Send + Sync {
    /// Get the delay before the next reconnection attempt
    ///
    /// # Arguments
    /// * `attempt` - The attempt number that just failed (0-indexed)
    ///
    /// # Returns
    /// * `Some(duration)` - Wait this long before retrying
    /// * `None` - The sequence is exhausted, stop retrying
    fn next_delay(&self, attempt: usize) -> Option<Duration>;

    /// Check whether another attempt is allowed after `attempt` failures
    fn should_retry(&self, attempt: usize) -> bool {
        self.next_delay(attempt).is_some()
    }
}

/// Exponential backoff policy
///
/// Delays grow as initial_delay * 2^attempt, capped at max_delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackOff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: Option<usize>,
}

impl ExponentialBackOff {
    /// Create a new exponential backoff policy
    ///
    /// # Arguments
    /// * `initial_delay` - Delay before the first retry
    /// * `max_delay` - Cap on the delay between retries
    /// * `max_retries` - Maximum number of retries (None = unlimited)
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: Option<usize>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_retries,
        }
    }
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), None)
    }
}

impl BackOffPolicy for ExponentialBackOff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if attempt >= max {
                return None;
            }
        }
        let initial = self.initial_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt.min(32) as u32);
        let delay = initial.saturating_mul(factor);
        Some(Duration::from_millis(
            delay.min(self.max_delay.as_millis() as u64),
        ))
    }
}

/// Fixed delay backoff policy
///
/// Always waits the same amount of time between attempts.
#[derive(Debug, Clone)]
pub struct FixedBackOff {
    delay: Duration,
    max_retries: Option<usize>,
}

impl FixedBackOff {
    /// Create a new fixed backoff policy
    ///
    /// # Arguments
    /// * `delay` - The fixed delay between retries
    /// * `max_retries` - Maximum number of retries (None = unlimited)
    pub fn new(delay: Duration, max_retries: Option<usize>) -> Self {
        Self { delay, max_retries }
    }
}

impl BackOffPolicy for FixedBackOff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        match self.max_retries {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Never-retry policy: every failure is final
#[derive(Debug, Clone)]
pub struct NoRetry;

impl BackOffPolicy for NoRetry {
    fn next_delay(&self, _attempt: usize) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = ExponentialBackOff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Some(6),
        );
        let delays: Vec<u64> = (0..6)
            .map(|i| policy.next_delay(i).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert!(policy.next_delay(6).is_none());
    }

    #[test]
    fn exponential_does_not_overflow() {
        let policy = ExponentialBackOff::new(
            Duration::from_millis(100),
            Duration::from_secs(3600),
            None,
        );
        let delay = policy.next_delay(200).unwrap();
        assert!(delay <= Duration::from_secs(3600));
    }

    #[test]
    fn fixed_respects_max_retries() {
        let policy = FixedBackOff::new(Duration::from_millis(100), Some(3));
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(3), None);
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn no_retry_is_final() {
        let policy = NoRetry;
        assert!(policy.next_delay(0).is_none());
        assert!(!policy.should_retry(0));
    }
}
