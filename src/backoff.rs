// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff and an async retry helper.
//!
//! Used by the producer's synchronous `send_with_retry` path and by the SQL
//! store's connection setup. The delivery-side retry path does NOT use this
//! — that is the sweeper's stateless sweep-and-republish model, which never
//! blocks a handler on a sleep.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for in-process retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::publish()
    }
}

impl BackoffConfig {
    /// Publish-side retry: 1s, 2s, 4s... capped at 30s.
    /// Matches the `2^attempt` seconds contract of `send_with_retry`.
    #[must_use]
    pub fn publish() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 3,
        }
    }

    /// Fast-fail retry for startup connections (bad config surfaces quickly).
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 5,
        }
    }

    /// Minimal delays for tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Run `operation` up to `config.max_attempts` times with exponential
/// backoff between failures. The observer is called after each failed
/// attempt with the 1-based attempt number, so the caller can record retry
/// state before the sleep (the producer updates its log row here).
pub async fn retry_with<F, Fut, T, E, O>(
    operation_name: &str,
    config: &BackoffConfig,
    mut operation: F,
    mut on_failure: O,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    O: FnMut(usize, &E),
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                on_failure(attempts, &err);

                if attempts >= config.max_attempts {
                    return Err(err);
                }

                warn!(
                    "operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_attempts, err, delay
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// [`retry_with`] without an observer.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &BackoffConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(operation_name, config, operation, |_, _| {}).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("op", &BackoffConfig::test(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("op", &BackoffConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("op", &BackoffConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_each_failure() {
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed_clone = observed.clone();

        let _: Result<(), TestError> = retry_with(
            "op",
            &BackoffConfig::test(),
            || async { Err(TestError("nope".into())) },
            |attempt, _err| observed_clone.lock().push(attempt),
        )
        .await;

        assert_eq!(*observed.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: 5,
        };

        let delay = (config.initial_delay.mul_f64(config.factor)).min(config.max_delay);
        assert_eq!(delay, Duration::from_secs(5));
    }
}
