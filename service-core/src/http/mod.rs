//! Outbound HTTP utilities shared by services that call third-party APIs.

pub mod retry;

pub use retry::{RetryConfig, Transient, is_retryable_status, retry_with_backoff};
