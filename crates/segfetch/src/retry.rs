//! Retry loop shared by segment, range and key fetches.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait the base delay.
    Fixed,
    /// Base delay doubled per attempt, capped at `max_delay`, plus optional
    /// random jitter of up to half the base delay.
    Exponential { max_delay: Duration, jitter: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first. `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Base delay between attempts.
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Some(4), Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: Option<u32>, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(
        max_attempts: Option<u32>,
        base_delay: Duration,
        max_delay: Duration,
        jitter: bool,
    ) -> Self {
        Self {
            max_attempts,
            delay: base_delay,
            backoff: Backoff::Exponential { max_delay, jitter },
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(Some(1), Duration::ZERO)
    }

    /// Delay before the retry following failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Backoff::Exponential { max_delay, jitter } = self.backoff else {
            return self.delay;
        };

        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self.delay.checked_mul(multiplier).unwrap_or(max_delay);
        let capped = exp_delay.min(max_delay);

        if !jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms = u64::try_from(max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(max_delay)
    }

    fn attempts_exhausted(&self, attempts_made: u32) -> bool {
        self.max_attempts
            .is_some_and(|max| attempts_made >= max.max(1))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts or `token` is cancelled.
    ///
    /// `operation` receives the 1-based attempt number and the error of the
    /// previous attempt, if any. Cancellation wins over everything else and
    /// surfaces as [`DownloadError::Cancelled`]; exhausting the attempts
    /// returns the last error unchanged.
    pub async fn run<F, Fut, T>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, DownloadError>
    where
        F: FnMut(u32, Option<&DownloadError>) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut last_error: Option<DownloadError> = None;
        let mut attempt: u32 = 1;

        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                result = operation(attempt, last_error.as_ref()) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() || token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if !err.is_retryable() || self.attempts_exhausted(attempt) {
                return Err(err);
            }

            let delay = self.delay_for_attempt(attempt - 1);
            warn!(
                attempt,
                max = ?self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );
            last_error = Some(err);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> DownloadError {
        DownloadError::http_status(StatusCode::SERVICE_UNAVAILABLE, "https://e/x", "segment")
    }

    /// Operation that fails the first `failures` calls.
    fn flaky(
        calls: Arc<AtomicU32>,
        failures: u32,
    ) -> impl FnMut(u32, Option<&DownloadError>) -> std::future::Ready<Result<u32, DownloadError>>
    {
        move |attempt, last| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(n, attempt);
            assert_eq!(last.is_some(), attempt > 1);
            std::future::ready(if n <= failures {
                Err(unavailable())
            } else {
                Ok(attempt)
            })
        }
    }

    #[test]
    fn exponential_delay_respects_max_cap() {
        let policy = RetryPolicy::exponential(
            Some(10),
            Duration::from_millis(500),
            Duration::from_secs(5),
            false,
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(
            Some(3),
            Duration::from_millis(100),
            Duration::from_secs(10),
            true,
        );
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(None, Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Some(4), Duration::from_millis(10));
        let token = CancellationToken::new();

        let result = policy.run(&token, flaky(calls.clone(), 3)).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Some(2), Duration::from_millis(10));
        let token = CancellationToken::new();

        let err = policy.run(&token, flaky(calls.clone(), 5)).await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_keeps_trying() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(None, Duration::from_millis(10));
        let token = CancellationToken::new();

        assert_eq!(policy.run(&token, flaky(calls.clone(), 20)).await.unwrap(), 21);
    }

    #[tokio::test]
    async fn non_retryable_error_is_returned_at_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Some(5), Duration::from_millis(10));
        let token = CancellationToken::new();

        let counter = calls.clone();
        let err = policy
            .run(&token, move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DownloadError::decryption("bad padding")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Decryption { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::fixed(None, Duration::from_secs(3600));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = policy
            .run(&token, |_, _| async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_operation() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        token.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let err = policy.run(&token, flaky(calls.clone(), 0)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
