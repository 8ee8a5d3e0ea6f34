use crate::config::RecoveryConfig;
use crate::time::Clock;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with deterministic jitter.
///
/// Delays grow as `base * factor^attempt`, capped at `max`, then scaled by a
/// jitter factor in `[1 - jitter, 1 + jitter]` and capped again.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
    seed: u64,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base,
            max,
            factor,
            jitter,
            attempt: 0,
            seed: 0,
        }
    }

    /// Vary the jitter sequence, so backoffs with distinct seeds spread out.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn from_config(cfg: &RecoveryConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.prompt_initial_delay_ms),
            Duration::from_millis(cfg.prompt_max_delay_ms),
            2.0,
            cfg.prompt_jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let multiplier = self.factor.powi(self.attempt.min(63) as i32);
        // Overflowing or non-finite products saturate at `max`.
        let delay = Duration::try_from_secs_f64(self.base.as_secs_f64() * multiplier)
            .map_or(self.max, |d| d.min(self.max));
        self.attempt = self.attempt.saturating_add(1);
        let jitter_factor = 1.0 - self.jitter + (self.pseudo_random() * 2.0 * self.jitter);
        delay.mul_f64(jitter_factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    // LCG step over seed and attempt; no RNG so replays are reproducible.
    fn pseudo_random(&self) -> f64 {
        let hash = (self.seed ^ self.attempt as u64)
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((hash >> 33) % 100) as f64 / 100.0
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RecoveryConfig) -> Self {
        Self {
            max_attempts: cfg.send_retry_attempts.max(1),
            delay: Duration::from_millis(cfg.send_retry_delay_ms),
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted, sleeping
/// on `clock` between attempts. Returns the last error.
pub async fn retry_async<C, T, E, F, Fut>(clock: &C, policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    C: Clock,
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                tracing::debug!(attempt, error = %err, "retrying after failure");
                clock.sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            2.0,
            0.0,
        );
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.attempt(), 4);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1_000),
            Duration::from_secs(60),
            1.0,
            0.2,
        );
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(799));
            assert!(delay <= Duration::from_millis(1_201));
        }
    }

    #[test]
    fn test_seeds_spread_delays() {
        let delays = |seed| {
            let mut backoff = Backoff::new(
                Duration::from_millis(1_000),
                Duration::from_secs(60),
                1.0,
                0.5,
            )
            .with_seed(seed);
            (0..5).map(|_| backoff.next_delay()).collect::<Vec<_>>()
        };
        assert_eq!(delays(7), delays(7));
        let distinct: std::collections::HashSet<_> = (0..8u64).map(delays).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_long_runs_saturate_at_max() {
        let mut backoff = Backoff::new(
            Duration::from_secs(5),
            Duration::from_secs(30),
            2.0,
            0.0,
        );
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(10),
        };
        let result: Result<u32, String> = retry_async(&clock, policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let clock = ManualClock::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        };
        let result: Result<(), String> =
            retry_async(&clock, policy, |attempt| async move { Err(format!("e{attempt}")) }).await;
        assert_eq!(result, Err("e2".to_string()));
    }
}
