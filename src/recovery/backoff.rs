//! Exponential backoff with jitter for recovery attempts.

use std::time::Duration;

use rand::Rng;

use super::classifier::{base_delay, FailureType};

/// Exponent cap. Keeps the delay representable as a timestamp offset.
const MAX_EXPONENT: u32 = 24;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            jitter_max: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(jitter_max: Duration) -> Self {
        Self { jitter_max }
    }

    /// `baseDelay(failure_type) * 2^retry_count + uniform(0, jitter_max)`.
    pub fn delay(&self, failure_type: FailureType, retry_count: u32) -> Duration {
        delay_before_jitter(failure_type, retry_count) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// The deterministic part of the delay.
pub fn delay_before_jitter(failure_type: FailureType, retry_count: u32) -> Duration {
    let factor = 1u32 << retry_count.min(MAX_EXPONENT);
    base_delay(failure_type).saturating_mul(factor)
}

/// Converts a std duration into a chrono offset, saturating on overflow.
pub fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_per_retry() {
        assert_eq!(delay_before_jitter(FailureType::Network, 0).as_secs(), 30);
        assert_eq!(delay_before_jitter(FailureType::Network, 1).as_secs(), 60);
        assert_eq!(delay_before_jitter(FailureType::Network, 2).as_secs(), 120);
        assert_eq!(delay_before_jitter(FailureType::RateLimit, 3).as_secs(), 480);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let d = policy.delay(FailureType::Timeout, 1);
            assert!(d >= Duration::from_secs(30));
            assert!(d <= Duration::from_secs(30) + Duration::from_millis(1000));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::new(Duration::ZERO);
        assert_eq!(
            policy.delay(FailureType::Authentication, 2),
            Duration::from_secs(1200)
        );
    }

    proptest! {
        #[test]
        fn delay_strictly_increases_with_retry_count(
            idx in 0usize..FailureType::ALL.len(),
            retry in 0u32..MAX_EXPONENT,
        ) {
            let ft = FailureType::ALL[idx];
            prop_assert!(delay_before_jitter(ft, retry + 1) > delay_before_jitter(ft, retry));
        }
    }
}
