//! Retry policy used when (re)establishing the notification subscription.
//!
//! The policy waits a fixed interval between attempts. `max_attempts` of
//! `None` means the caller keeps retrying forever, which is what the agent
//! does by default. Tests build zero-interval policies with
//! [`RetryPolicy::immediate`].

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Retries forever with the given interval.
    pub fn unbounded(interval: Duration) -> Self {
        Self::new(interval, None)
    }

    /// No wait between attempts.
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self::new(Duration::ZERO, max_attempts)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }

    /// Sleeps for the backoff interval. Returns immediately for a zero interval.
    pub async fn wait(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Default for RetryPolicy {
    /// Default: retry forever every 5 seconds.
    fn default() -> Self {
        Self::unbounded(Duration::from_secs(5))
    }
}
