//! Retry policy with exponential backoff and jitter.
//!
//! Used by every network call in the crate:
//! - S3 requests (base 100ms, capped at 30s)
//! - Multipart upload service requests (base 500ms, doubling)
//!
//! Classification is left to the caller, so the same loop serves the
//! reqwest wrapper in [`crate::http`] and the S3 object client.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info_span, warn, Instrument};

use crate::metrics::record_retry;

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries. The operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Policy for S3 requests.
    pub fn s3(max_retries: u32) -> Self {
        Self::new(
            max_retries,
            Duration::from_millis(100),
            Duration::from_secs(30),
        )
    }

    /// Policy for the multipart upload service.
    pub fn http_upload(max_retries: u32) -> Self {
        Self::new(
            max_retries,
            Duration::from_millis(500),
            Duration::from_secs(60),
        )
    }

    /// A policy that never waits. Handy for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt + 1`:
    /// `min(max_delay, base_delay * 2^attempt)`, jittered between the base
    /// delay and that cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let exp_delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let capped = exp_delay.min(max_ms);
        if capped <= base_ms {
            return Duration::from_millis(capped);
        }

        let jittered = rand::rng().random_range(base_ms..=capped);
        Duration::from_millis(jittered)
    }
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Whether a failed attempt should be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

/// The last error of a retried operation.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// True when the error was retryable but the budget ran out.
    pub exhausted: bool,
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

/// Execute an async operation with retry.
///
/// `op` receives the zero-based attempt number. `classify` decides whether
/// an error is worth another attempt; errors classified as
/// [`RetryDecision::Stop`] are returned right away.
pub async fn execute<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
    classify: C,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        let span = info_span!("storage_retry", operation = %operation, attempt = attempt + 1);

        match op(attempt).instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable = classify(&e) == RetryDecision::Retry;
                if !retryable || attempt >= policy.max_retries {
                    return Err(RetryFailure {
                        attempts: attempt + 1,
                        exhausted: retryable,
                        error: e,
                    });
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Storage operation failed, retrying: {}",
                    e
                );
                record_retry(operation);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
