use std::time::Duration;

use rand::Rng;

/// An exponential strategy: the nth cool-off is `base * factor^(n-1)`, optionally
/// randomized by a jitter fraction and always capped at `max_interval`. With
/// `max_attempts = Some(n)` the iterator yields at most n intervals; `None` retries
/// indefinitely.
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// Jitter fraction in `[0.0, 1.0]`; each interval is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    jitter: f64,
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter,
            max_attempts,
            attempt: 0,
        }
    }

    /// Convenience constructor with a doubling factor and mild jitter.
    pub fn from_millis(base_ms: u64, max_ms: u64, max_attempts: Option<u16>) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            2.0,
            0.25,
            max_attempts,
        )
    }

    fn interval_for(&self, attempt: u16) -> Duration {
        // attempt is always >= 1 when called from next()
        let exponent = i32::from(attempt.saturating_sub(1));
        let base_ms = (self.base_interval.as_millis() as f64) * self.factor.powi(exponent);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_ms as u64).min(self.max_interval);
        }

        let scale: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_ms * scale) as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }

        self.attempt += 1;
        Some(self.interval_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_the_factor_without_jitter() {
        let mut strategy = Exponential::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
            0.0,
            None,
        );
        assert_eq!(strategy.next(), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next(), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn caps_at_the_max_interval() {
        let mut strategy = Exponential::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            2.0,
            0.0,
            None,
        );
        strategy.next();
        strategy.next();
        assert_eq!(strategy.next(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn stops_after_max_attempts() {
        let strategy = Exponential::from_millis(1, 10, Some(4));
        assert_eq!(strategy.count(), 4);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut strategy = Exponential::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
            0.5,
            None,
        );
        let interval = strategy.next().unwrap();
        assert!(interval >= Duration::from_millis(50));
        assert!(interval <= Duration::from_millis(150));
    }
}
