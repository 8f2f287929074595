//! Reconnect delay schedule.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Exponential delay between automatic reconnects.
///
/// Retries are numbered from 1, matching the attempt number reported to
/// state observers: retry 1 waits `base`, retry 2 waits `base * factor`,
/// and so on up to `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    /// Share of each delay (0.0-1.0) that may be randomly shaved off.
    jitter: f64,
}

impl Backoff {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: config.reconnect_base_delay,
            max: config.reconnect_max_delay,
            factor: config.reconnect_backoff_factor,
            jitter: config.reconnect_jitter,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("Reconnect base delay must be > 0".to_string());
        }
        if self.max < self.base {
            return Err("Max reconnect delay must be >= reconnect base delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Upper bound of the delay before `retry` (1-based).
    pub(crate) fn ceiling(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        }
    }

    /// Delay before `retry` (1-based), with jitter applied.
    pub(crate) fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        if self.jitter == 0.0 {
            return ceiling;
        }
        let shave = rand::rng().random_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - shave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn first_retry_waits_base_delay() {
        assert_eq!(backoff(0.0).delay(1), Duration::from_millis(1000));
        // Retry 0 never happens; it is clamped to the first delay.
        assert_eq!(backoff(0.0).delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = backoff(0.0);
        let delays: Vec<u128> = (1..=7).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        let backoff = backoff(0.5);
        for retry in 1..8 {
            let delay = backoff.delay(retry);
            let ceiling = backoff.ceiling(retry);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling.mul_f64(0.5));
        }
    }

    #[test]
    fn defaults_come_from_client_config() {
        let backoff = Backoff::from_config(&ClientConfig::default());
        assert_eq!(backoff, self::backoff(0.0));
        assert!(backoff.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut backoff = backoff(0.0);
        backoff.max = Duration::from_millis(10);
        assert_eq!(
            backoff.validate().unwrap_err(),
            "Max reconnect delay must be >= reconnect base delay"
        );
    }
}
