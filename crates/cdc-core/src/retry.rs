//! Bounded retry policy
//!
//! Connection and publish retries share one policy type. Delays go through a
//! [`Sleeper`] so retry schedules can be exercised without real time.

use crate::config::RetryConfig;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Retry policy with fixed or exponential delay
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Delay grows by `multiplier` per attempt, capped at `max_delay`
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay = Duration::from_millis(delay as u64);
        std::cmp::min(delay, self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        operation: &str,
        mut op: F,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && self.should_retry(attempt) => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    sleeper.sleep(delay).await;
                }
                Err(error) => {
                    return Err(RetryError {
                        attempts: attempt,
                        exhausted: error.is_retryable(),
                        last: error,
                    })
                }
            }
        }
    }
}

/// Bound one attempt with a timeout; expiry is a retryable [`CdcError::Timeout`]
pub async fn with_timeout<T, Fut>(operation: &str, duration: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(CdcError::timeout(operation, duration.as_millis() as u64)),
    }
}

/// Failure of a retried operation
#[derive(Debug)]
pub struct RetryError {
    /// Attempts made, including the last one
    pub attempts: u32,
    /// True when the budget ran out on a retryable error
    pub exhausted: bool,
    pub last: CdcError,
}

/// Sleep abstraction for retry delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real-time sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and records requested delays
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|delays| delays.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(9), Duration::from_secs(5));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_run_retries_transient_until_success() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(5));
        let sleeper = RecordingSleeper::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&sleeper, "connect", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CdcError::transient("feed", "connection refused"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(5); 2]);
    }

    #[tokio::test]
    async fn test_run_stops_at_budget() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));
        let sleeper = RecordingSleeper::new();

        let err = policy
            .run(&sleeper, "publish", |_| async {
                Err::<(), _>(CdcError::timeout("publish", 10))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert!(err.exhausted);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let err = with_timeout("publish", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CdcError::Timeout { duration_ms: 10, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_errors() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1));
        let sleeper = RecordingSleeper::new();

        let err = policy
            .run(&sleeper, "subscribe", |_| async {
                Err::<(), _>(CdcError::resume_gap("history lost", None))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert!(!err.exhausted);
        assert!(matches!(err.last, CdcError::ResumeGap { .. }));
        assert!(sleeper.delays().is_empty());
    }
}
