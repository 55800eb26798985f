//! Bounded exponential backoff with jitter.

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), capped, with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.base.saturating_mul(1u32 << shift).min(self.max);
        let jitter_cap = u64::try_from(exp.as_millis() / 2).unwrap_or(0);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::random::<u64>() % (jitter_cap + 1)
        };
        exp.saturating_add(Duration::from_millis(jitter)).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry<T, E, F, Fut, R>(&self, label: &str, retryable: R, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "{label} attempt {attempt}/{} failed, retrying in {delay:?}: {err}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> Backoff {
        Backoff::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let backoff = Backoff::new(10, Duration::from_millis(10), Duration::from_millis(100));
        let first = backoff.delay_for(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, String> = fast(4)
            .retry("op", |_| true, || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("busy {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), String> = fast(3)
            .retry("op", |_| true, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), String> = fast(5)
            .retry("op", |e: &String| e != "fatal", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
