//! Exponential backoff with jitter.
//!
//! The delay before retry `n` (1-based) is
//! `min(base * multiplier^(n-1) + jitter, max_delay)`, with `jitter` drawn
//! uniformly from `0..=jitter_max`. The wait is raced against a cancellation
//! token so a caller can abandon a request while it is backing off.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use offline_translate_types::{ErrorKind, RetryOptions, TranslateError};
use rand::Rng;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryOptions::default())
    }
}

impl From<&RetryOptions> for RetryPolicy {
    fn from(options: &RetryOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay: Duration::from_millis(options.retry_delay),
            multiplier: options.retry_multiplier,
            max_delay: Duration::from_millis(options.max_delay),
            jitter_max: Duration::from_millis(options.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt` for a given jitter sample.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let total_ms = backoff_ms + jitter.as_millis() as f64;
        let capped_ms = total_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }

    /// Delay before retry number `attempt`, with a fresh jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, self.sample_jitter())
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Default retry predicate: the error kind's own recoverability.
pub fn is_retryable(error: &TranslateError) -> bool {
    error.is_retryable()
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent. `operation` receives the 0-based attempt
/// number. The last error is returned when retries run out.
pub async fn with_retry<T, F, Fut, P>(
    mut operation: F,
    policy: &RetryPolicy,
    should_retry: P,
    cancel: &CancellationToken,
    label: &str,
) -> Result<T, TranslateError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TranslateError>>,
    P: Fn(&TranslateError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(label));
        }
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("[RETRY] {label} succeeded after {attempt} retries");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if error.kind == ErrorKind::Cancelled || !should_retry(&error) {
            return Err(error);
        }
        if attempt >= policy.max_retries {
            warn!(
                "[RETRY] {label} giving up after {} attempts: {error}",
                attempt + 1
            );
            return Err(error);
        }

        attempt += 1;
        let delay = policy.next_delay(attempt);
        warn!(
            "[RETRY] {label} attempt {attempt}/{} in {}ms: {error}",
            policy.max_retries,
            delay.as_millis()
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                debug!("[RETRY] {label} cancelled during backoff");
                return Err(cancelled(label));
            }
        }
    }
}

fn cancelled(label: &str) -> TranslateError {
    TranslateError::new(ErrorKind::Cancelled, format!("{label} cancelled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            jitter_max: Duration::ZERO,
        }
    }

    #[test]
    fn test_delay_formula_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2, Duration::ZERO), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3, Duration::from_millis(150)), Duration::from_millis(4150));
        assert_eq!(p.delay_for(5, Duration::ZERO), Duration::from_millis(10_000));
        assert_eq!(p.delay_for(4, Duration::from_millis(300)), Duration::from_millis(8300));
        assert_eq!(p.delay_for(5, Duration::from_millis(300)), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = RetryPolicy {
            jitter_max: Duration::from_millis(300),
            ..policy()
        };
        for _ in 0..200 {
            let d = p.next_delay(1);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(1300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_fourth_failure_surfaces() {
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let start = Instant::now();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = with_retry(
            |_| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(Instant::now());
                    Err(TranslateError::worker("boom"))
                }
            },
            &policy(),
            is_retryable,
            &cancel,
            "test",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerError);
        let offsets: Vec<u128> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| (*t - start).as_millis())
            .collect();
        let expected = [0u128, 1000, 3000, 7000];
        assert_eq!(offsets.len(), expected.len());
        for (got, want) in offsets.iter().zip(expected) {
            assert!(*got >= want && *got < want + 10, "{offsets:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_immediately() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(
            |_| {
                calls += 1;
                async { Err(TranslateError::invalid_input("empty")) }
            },
            &policy(),
            is_retryable,
            &CancellationToken::new(),
            "test",
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidInput);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let result = with_retry(
            |attempt| async move {
                if attempt < 2 {
                    Err(TranslateError::worker("flaky"))
                } else {
                    Ok(attempt)
                }
            },
            &policy(),
            is_retryable,
            &CancellationToken::new(),
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = with_retry(
            |_| async { Err(TranslateError::worker("boom")) },
            &policy(),
            is_retryable,
            &cancel,
            "test",
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        let waited = (Instant::now() - start).as_millis();
        assert!((500..510).contains(&waited), "{waited}");
    }
}
