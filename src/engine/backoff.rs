use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Exponential backoff with full jitter. Each failed attempt doubles the
/// ceiling up to `cap`; the actual delay is a uniform slice of the ceiling.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Forget accumulated failures after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        ceiling.mul_f64(jitter_fraction())
    }

    /// Ceiling for the upcoming attempt: `base * 2^attempt`, capped.
    fn ceiling(&self) -> Duration {
        let shift = self.attempt.min(16);
        self.base
            .saturating_mul(1u32 << shift)
            .min(self.cap)
    }
}

/// Uniform-ish fraction in [0, 1) taken from the clock's sub-second noise.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(500_000_000);
    f64::from(nanos) / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut ceilings = Vec::new();
        for _ in 0..8 {
            ceilings.push(backoff.ceiling());
            backoff.next_delay();
        }
        assert_eq!(
            ceilings,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn delay_never_exceeds_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..20 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
            assert!(delay <= Duration::from_secs(30));
        }
    }

    #[test]
    fn reset_restarts_the_ladder() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..6 {
            backoff.next_delay();
        }
        assert_eq!(backoff.ceiling(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }

    #[test]
    fn fraction_is_in_unit_interval() {
        for _ in 0..100 {
            let f = jitter_fraction();
            assert!((0.0..1.0).contains(&f));
        }
    }
}
