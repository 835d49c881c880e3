//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::RetryConfig;
use crate::{Error, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Create an exponential backoff builder
    #[must_use]
    pub fn create_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Execute a future with retry logic
///
/// Only errors for which [`Error::is_retryable`] holds are retried; anything
/// else is returned on the first occurrence.
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !policy.enabled {
        return f().await;
    }

    f.retry(policy.create_backoff())
        .when(Error::is_retryable)
        .notify(|err: &Error, delay: Duration| {
            debug!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retrying after backoff"
            );
        })
        .await
}
