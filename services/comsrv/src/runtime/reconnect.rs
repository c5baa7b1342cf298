//! Reconnection mechanism implementation
//!
//! Capped exponential backoff with optional jitter. The channel loop owns a
//! [`ReconnectHelper`] and asks it how long to wait before the next attempt.

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum retry attempts (0 means unlimited)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound of any delay
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier,
            jitter: true,
        }
    }

    /// Fixed short delays, for tests and simulations
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay after `failures` consecutive failed attempts (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let max_secs = self.max_delay.as_secs_f64();
        // clamp in f64 first, the scaled value may not fit a Duration
        let base_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        let mut delay = if base_secs.is_finite() && base_secs < max_secs {
            Duration::from_nanos((base_secs * 1e9).round() as u64)
        } else {
            self.max_delay
        };

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64).min(self.max_delay);
            }
        }
        delay
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

/// Tracks consecutive failures of one channel
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Consecutive failures since the last successful connect
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn mark_connected(&mut self) {
        if self.failures > 0 {
            self.stats.successful_reconnects += 1;
        }
        self.failures = 0;
        self.stats.last_connected = Some(Instant::now());
        debug!("Connection marked as successful");
    }

    /// Record a failed attempt; `None` once the attempt budget is spent
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        self.stats.total_attempts += 1;
        self.stats.failed_reconnects += 1;
        if self.exhausted() {
            return None;
        }
        Some(self.policy.delay_for(self.failures))
    }

    pub fn exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.failures >= self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter(0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_limit() {
        let policy = ReconnectPolicy {
            max_delay: Duration::from_secs(5),
            jitter: true,
            ..no_jitter(0)
        };
        for failures in 1..40 {
            assert!(policy.delay_for(failures) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_steep_backoff_saturates_at_max_delay() {
        let policy = ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::from_config(0, 1000, 60_000, 5.0)
        };
        assert_eq!(policy.delay_for(3), Duration::from_secs(25));
        for failures in 4..200 {
            assert_eq!(policy.delay_for(failures), Duration::from_secs(60));
        }
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));

        let runaway = ReconnectPolicy {
            backoff_multiplier: f64::INFINITY,
            ..policy
        };
        assert_eq!(runaway.delay_for(2), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = ReconnectPolicy {
            jitter: true,
            ..no_jitter(0)
        };
        for _ in 0..50 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_millis(300) && delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_max_attempts() {
        let mut helper = ReconnectHelper::new(no_jitter(2));
        assert_eq!(helper.record_failure(), Some(Duration::from_millis(100)));
        assert_eq!(helper.record_failure(), None);
        assert!(helper.exhausted());
        assert_eq!(helper.stats().failed_reconnects, 2);
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut helper = ReconnectHelper::new(no_jitter(0));
        helper.record_failure();
        helper.record_failure();
        assert_eq!(helper.failures(), 2);

        helper.mark_connected();
        assert_eq!(helper.failures(), 0);
        assert_eq!(helper.stats().successful_reconnects, 1);
        assert_eq!(helper.record_failure(), Some(Duration::from_millis(100)));
    }
}
