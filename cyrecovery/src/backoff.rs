//! Exponential retry backoff with jitter.

use std::time::Duration;

use cybase::TimeoutConfig;
use rand::Rng;

/// Computes `min(base × 2^attempt, max) ± jitter` for send retries and
/// reconnection attempts alike.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(
            config.backoff_base(),
            config.backoff_max(),
            config.backoff_jitter(),
        )
    }

    /// The delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20); // past this the cap always wins
        let scaled = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter.is_zero() {
            return scaled;
        }
        let spread = self.jitter.as_millis() as u64;
        let offset = rand::rng().random_range(0..=spread * 2);
        let jittered = scaled.as_millis() as u64 + offset;
        Duration::from_millis(jittered.saturating_sub(spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let backoff = Backoff::new(
            Duration::from_millis(250),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(5));
        assert_eq!(backoff.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_its_band() {
        let backoff = Backoff::new(
            Duration::from_millis(250),
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        for attempt in 0..6 {
            let nominal = Backoff::new(
                Duration::from_millis(250),
                Duration::from_secs(5),
                Duration::ZERO,
            )
            .delay(attempt);
            for _ in 0..50 {
                let delay = backoff.delay(attempt);
                assert!(delay >= nominal.saturating_sub(Duration::from_millis(100)));
                assert!(delay <= nominal + Duration::from_millis(100));
            }
        }
    }
}
