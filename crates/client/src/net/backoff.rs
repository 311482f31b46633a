use std::time::Duration;

use rand::Rng;

/// Upper bound on the exponent so `factor^attempts` stays finite.
const MAX_EXPONENT: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
    /// Zero means retry forever.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            factor: 2.0,
            jitter_ms: 250,
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    /// `min(max_delay, base_delay * factor^attempts)` plus uniform jitter in
    /// `[0, jitter_ms]`.
    pub fn delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let exponent = attempts.min(MAX_EXPONENT) as i32;
        let scaled = self.base_delay_ms as f64 * self.factor.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0) as u64;
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        !self.enabled || (self.max_retries > 0 && attempts >= self.max_retries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Attempt counter driven by the transport state machine.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called after a failed attempt or a dropped session. Scheduling a retry
    /// consumes one attempt.
    pub fn on_failure<R: Rng + ?Sized>(&mut self, rng: &mut R) -> RetryDecision {
        if self.config.is_exhausted(self.attempts) {
            return RetryDecision::GiveUp;
        }
        let delay = self.config.delay(self.attempts, rng);
        self.attempts += 1;
        RetryDecision::Retry(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn config(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            enabled: true,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter_ms: 0,
            max_retries,
        }
    }

    #[test]
    fn test_first_delay_is_base() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(config(5));

        assert_eq!(
            backoff.on_failure(&mut rng),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(config(0));

        let delays: Vec<u64> = (0..6)
            .map(|_| match backoff.on_failure(&mut rng) {
                RetryDecision::Retry(delay) => delay.as_millis() as u64,
                RetryDecision::GiveUp => panic!("unlimited retries gave up"),
            })
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_gives_up_at_retry_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(config(3));

        for _ in 0..3 {
            assert!(matches!(backoff.on_failure(&mut rng), RetryDecision::Retry(_)));
        }
        assert_eq!(backoff.on_failure(&mut rng), RetryDecision::GiveUp);
        assert_eq!(backoff.on_failure(&mut rng), RetryDecision::GiveUp);

        backoff.reset();
        assert_eq!(
            backoff.on_failure(&mut rng),
            RetryDecision::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_disabled_never_retries() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(BackoffConfig {
            enabled: false,
            ..config(0)
        });
        assert_eq!(backoff.on_failure(&mut rng), RetryDecision::GiveUp);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let jittery = BackoffConfig {
            jitter_ms: 50,
            ..config(0)
        };
        for _ in 0..200 {
            let delay = jittery.delay(0, &mut rng).as_millis() as u64;
            assert!((100..=150).contains(&delay));
        }
    }
}
