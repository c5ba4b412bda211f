//! Retry utilities for outbound HTTP calls to external providers.
//!
//! Provides configurable retry logic with exponential backoff. Only transient
//! failures (network errors, timeouts, 429, 5xx) are retried; any other 4xx
//! fails immediately.

use http::StatusCode;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt budget and base delay.
    pub fn exponential(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Errors that know whether repeating the call could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Whether an HTTP response status is worth retrying.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Execute an outbound call with retry logic.
///
/// # Example
/// ```ignore
/// let token = retry_with_backoff(&RetryConfig::default(), "mpesa_oauth", || async {
///     client.fetch_token().await
/// })
/// .await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Outbound call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_transient() {
                    warn!(
                        operation = operation_name,
                        error = %error,
                        "Outbound call failed with permanent error, not retrying"
                    );
                    return Err(error);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        "Outbound call failed after max retries"
                    );
                    return Err(error);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %error,
                    backoff_ms = backoff.as_millis() as u64,
                    "Outbound call failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
