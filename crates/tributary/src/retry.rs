//! Backoff-driven retries for rate checks and GraphQL queries.
//!
//! Async REST requests are retried by resubmitting through their scheduler
//! instead, so they keep consuming rate-limit ticks between attempts.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{HarvestError, Result, short_error_message};
use crate::progress::{self, HarvestProgress, ProgressCallback};

/// Initial delay before the first retry.
pub const INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Configuration for retry operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retry attempts.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_retries: 3,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retries,
            with_jitter: true,
        }
    }

    /// Default delays with a custom retry count.
    #[must_use]
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Run `operation`, retrying retryable failures with exponential backoff.
///
/// Only errors for which [`HarvestError::is_retryable`] holds are retried;
/// every retry is logged and reported as [`HarvestProgress::RequestRetry`].
///
/// # Example
///
/// ```ignore
/// let response = with_retry(
///     || client.send(HttpMethod::Options, "", &[], &[], None),
///     RetryConfig::with_max_retries(3),
///     "rate limit check",
///     None,
/// )
/// .await?;
/// ```
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    config: RetryConfig,
    target: &str,
    on_progress: Option<&ProgressCallback>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retry = config.max_retries;
    let attempt = AtomicUsize::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.into_backoff())
        .notify(|err: &HarvestError, dur| {
            let current = attempt.load(Ordering::SeqCst);
            progress::emit(
                on_progress,
                HarvestProgress::RequestRetry {
                    url: target.to_string(),
                    attempt: current,
                    max_retry,
                },
            );
            tracing::warn!(
                target_name = target,
                attempt = current,
                delay = ?dur,
                error = %short_error_message(err),
                "Retrying after failure"
            );
        })
        .when(HarvestError::is_retryable)
        .await
}
