//! Parameterised retry with fixed or exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
            backoff,
            jitter: false,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, 0, 0, Backoff::Fixed)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is `delay_for(1)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential { factor } => base * factor.powi(attempt.saturating_sub(1) as i32),
        };
        let mut delay = (raw as u64).min(self.max_delay_ms.max(self.base_delay_ms));

        if self.jitter && delay > 0 {
            // +/- 25%
            let range = delay / 4;
            let offset = fastrand::u64(0..=range * 2);
            delay = (delay + offset).saturating_sub(range);
        }

        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds or attempts are exhausted; returns the last error.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(label, |_| true, op).await
    }

    /// Like [`run`](Self::run) but stops early when `retryable` rejects the error.
    pub async fn run_if<T, E, F, Fut, P>(&self, label: &str, retryable: P, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2000, 30_000, Backoff::Exponential { factor: 2.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::new(5, 100, 350, Backoff::Exponential { factor: 2.0 });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(3, 2000, 0, Backoff::Fixed);
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3, 1000, 10_000, Backoff::Fixed).with_jitter(true);
        for _ in 0..100 {
            let ms = policy.delay_for(1).as_millis();
            assert!((750..=1250).contains(&ms), "delay {ms} out of range");
        }
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 10, 100, Backoff::Fixed);

        let result: Result<u32, String> = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 3 { Err(format!("fail {attempt}")) } else { Ok(attempt) } }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(2, 10, 100, Backoff::Fixed);
        let result: Result<(), String> = policy.run("down", |attempt| async move { Err(format!("fail {attempt}")) }).await;
        assert_eq!(result, Err("fail 2".to_string()));
    }

    #[tokio::test]
    async fn test_run_if_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 0, 0, Backoff::Fixed);

        let result: Result<(), &str> = policy
            .run_if("permanent", |e| *e != "404", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("404") }
            })
            .await;

        assert_eq!(result, Err("404"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
