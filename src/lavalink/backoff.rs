use std::time::Duration;

/// Exponential reconnect backoff bounded by a number of attempts.
pub(super) struct Backoff {
    base: Duration,
    max: Duration,
    limit: u32,
    attempt: u32,
}

impl Backoff {
    pub(super) fn new(base: Duration, max: Duration, limit: u32) -> Self {
        Self {
            base,
            max,
            limit,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the limit is reached.
    pub(super) fn next(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let factor = 2u32.saturating_pow((self.attempt - 1).min(16));
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub(super) fn attempts(&self) -> u32 {
        self.attempt
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.attempt >= self.limit
    }

    pub(super) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 10);

        let delays: Vec<_> = (0..5).map(|_| backoff.next().unwrap()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn exhausts_after_limit_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(40), Duration::from_secs(1), 2);

        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_none());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(!backoff.is_exhausted());
    }
}
