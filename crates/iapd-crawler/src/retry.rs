use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::http::{HttpError, HttpErrorKind};
use iapd_core::config::HttpConfig;

/// Verdict of the failure classifier: retry or propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

/// Classify an HTTP failure. Pure in its input: network timeouts, connection
/// resets, HTTP 5xx, and 408/429 are transient; every other 4xx (403
/// included) is terminal; cancellation always propagates; anything
/// unrecognized takes `unknown_class`.
pub fn classify(err: &HttpError, unknown_class: ErrorClass) -> ErrorClass {
    match err.kind {
        HttpErrorKind::Timeout | HttpErrorKind::Connect => ErrorClass::Transient,
        HttpErrorKind::Status(408) | HttpErrorKind::Status(429) => ErrorClass::Transient,
        HttpErrorKind::Status(code) if (500..600).contains(&code) => ErrorClass::Transient,
        HttpErrorKind::Status(_) => ErrorClass::Terminal,
        HttpErrorKind::Body => ErrorClass::Transient,
        HttpErrorKind::Cancelled => ErrorClass::Terminal,
        HttpErrorKind::Other => unknown_class,
    }
}

/// Default classifier: unknown failures are transient.
pub fn classify_default(err: &HttpError) -> ErrorClass {
    classify(err, ErrorClass::Transient)
}

/// Backoff schedule parameters for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1_000),
            max_interval: Duration::from_secs(60),
        }
    }
}

/// **Retry Executor**
///
/// Bounded-retry wrapper with exponential backoff and jitter. Attempt `n`
/// sleeps `initial × 2^(n-1)` capped at the max interval, with ±20% uniform
/// jitter from the backoff schedule. Only failures the classifier calls
/// transient are retried; terminal failures and cancellation propagate
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Executor configured from the HTTP section of the pipeline config.
    pub fn from_http_config(config: &HttpConfig) -> Self {
        Self::new(RetryPolicy {
            max_attempts: config.max_retries,
            initial_interval: Duration::from_millis(config.retry_base_ms),
            max_interval: Duration::from_secs(60),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` up to `max_attempts` times.
    pub async fn run<T, F, Fut, C>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<T, HttpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
        C: Fn(&HttpError) -> ErrorClass,
    {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_interval)
            .with_randomization_factor(0.2)
            .with_multiplier(2.0)
            .with_max_interval(self.policy.max_interval)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.is_cancelled()
                        || attempt >= self.policy.max_attempts
                        || classify(&err) == ErrorClass::Terminal
                    {
                        return Err(err);
                    }
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or(self.policy.max_interval);
                    warn!(
                        "attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.policy.max_attempts, err, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(HttpError::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify_rules() {
        let transient = [
            HttpError::new(HttpErrorKind::Timeout, "t"),
            HttpError::new(HttpErrorKind::Connect, "c"),
            HttpError::status(408),
            HttpError::status(429),
            HttpError::status(500),
            HttpError::status(503),
            HttpError::new(HttpErrorKind::Body, "b"),
        ];
        for err in &transient {
            assert_eq!(classify_default(err), ErrorClass::Transient, "{err}");
        }

        let terminal = [
            HttpError::status(400),
            HttpError::status(403),
            HttpError::status(404),
            HttpError::cancelled(),
        ];
        for err in &terminal {
            assert_eq!(classify_default(err), ErrorClass::Terminal, "{err}");
        }
    }

    #[test]
    fn test_classify_is_pure() {
        let err = HttpError::status(503);
        for _ in 0..10 {
            assert_eq!(classify_default(&err), ErrorClass::Transient);
        }
    }

    #[test]
    fn test_unknown_class_is_configurable() {
        let err = HttpError::new(HttpErrorKind::Other, "mystery");
        assert_eq!(classify(&err, ErrorClass::Transient), ErrorClass::Transient);
        assert_eq!(classify(&err, ErrorClass::Terminal), ErrorClass::Terminal);
    }

    fn quick_executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = quick_executor(3)
            .run(&cancel, classify_default, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HttpError::status(503))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<u32, _> = quick_executor(3)
            .run(&cancel, classify_default, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpError::status(404))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, HttpErrorKind::Status(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<u32, _> = quick_executor(3)
            .run(&cancel, classify_default, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpError::status(500))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(60),
        });

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let start = std::time::Instant::now();
        let result: Result<u32, _> = executor
            .run(&cancel, classify_default, || async {
                Err(HttpError::status(500))
            })
            .await;
        canceller.await.unwrap();

        assert!(result.unwrap_err().is_cancelled());
        // Returned from the 30 s backoff sleep as soon as the signal fired.
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
