//! Jittered exponential backoff for reconnects

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Delay schedule between connect attempts
///
/// Delay `n` (0-based) is `base * 2^n`, capped at `max`, then moved up or
/// down at random by at most `jitter` of itself.
#[derive(Clone, Debug)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_attempts: u32,
    current_attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let nominal = self.nominal_delay(self.current_attempt);
        self.current_attempt += 1;

        if self.jitter == 0.0 {
            return Some(nominal);
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Some(nominal.mul_f64(factor))
    }

    /// Un-jittered delay for attempt `attempt`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Start over after a successful connect
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn should_retry(&self) -> bool {
        self.current_attempt < self.max_attempts
    }

    /// Attempts handed out since the last reset
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            jitter,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = Backoff::new(&config(0.0));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(8_000)));
        // Capped
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(8_000)));
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::new(&ReconnectConfig {
            max_attempts: 3,
            ..config(0.0)
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(!backoff.should_retry());
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(&config(0.2));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current_attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert!(backoff.should_retry());
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..200 {
            let mut backoff = Backoff::new(&config(0.2));
            for attempt in 0..6 {
                let nominal = backoff.nominal_delay(attempt);
                let delay = backoff.next_delay().unwrap();
                assert!(delay >= nominal.mul_f64(0.8) && delay <= nominal.mul_f64(1.2));
            }
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(&config(0.0));
        assert_eq!(backoff.nominal_delay(100), Duration::from_millis(8_000));
    }
}
