//! Retry with exponential backoff, shared by index listing and artifact downloads

use crate::error::FetchError;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff policy: `base * 2^(attempt-1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Returns the final result and
    /// the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> (Result<T, FetchError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return (Err(FetchError::Cancelled), attempt);
            }
            attempt += 1;
            debug!(target_url = %target, attempt, max = self.max_attempts, "Attempting fetch");

            let error = match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.max_attempts {
                return (Err(error), attempt);
            }

            let delay = self.delay_for(attempt);
            warn!(
                target_url = %target,
                attempt,
                max = self.max_attempts,
                error = %error,
                "Transient failure, retrying in {:?}",
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return (Err(FetchError::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Map a non-success HTTP status to a fetch error; `None` for 2xx
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND {
        Some(FetchError::NotFound)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(FetchError::Transient(format!("HTTP {}", status)))
    } else {
        Some(FetchError::Permanent(format!("HTTP {}", status)))
    }
}

/// Classify a transport-level error from reqwest
pub fn classify_reqwest(err: &reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        if let Some(classified) = classify_status(status) {
            return classified;
        }
    }

    if err.is_builder() {
        FetchError::Permanent(err.to_string())
    } else {
        // timeouts, connect errors, resets mid-body
        FetchError::Transient(err.to_string())
    }
}
