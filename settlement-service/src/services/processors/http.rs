//! Wire plumbing shared by the processor adapters.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::ProcessorError;

/// Some processor edges reject requests that do not look like a browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const MAX_ERROR_BODY: usize = 512;

/// HTTP client with the processor timeout and browser-like default headers.
pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let client = Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// Raw response captured before any interpretation.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl RawResponse {
    /// Turn any non-2xx into a [`ProcessorError::Http`].
    pub fn ensure_success(self, processor: &'static str) -> Result<Self, ProcessorError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ProcessorError::Http {
                processor,
                status: self.status.as_u16(),
                body: truncate(&self.body),
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self, processor: &'static str) -> Result<T, ProcessorError> {
        serde_json::from_str(&self.body).map_err(|e| ProcessorError::InvalidResponse {
            processor,
            message: format!("{}: {}", e, truncate(&self.body)),
        })
    }

    pub fn json_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|_| serde_json::Value::String(self.body.clone()))
    }
}

/// Send a request once, reading the full body.
pub async fn send(
    processor: &'static str,
    operation: &'static str,
    request: RequestBuilder,
) -> Result<RawResponse, ProcessorError> {
    let result = async {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok::<_, reqwest::Error>(RawResponse { status, body })
    }
    .await;

    match result {
        Ok(raw) => {
            tracing::debug!(
                processor,
                operation,
                status = %raw.status,
                "Processor response received"
            );
            metrics::counter!(
                "processor_requests_total",
                "processor" => processor,
                "operation" => operation,
                "outcome" => if raw.status.is_success() { "ok" } else { "http_error" }
            )
            .increment(1);
            Ok(raw)
        }
        Err(e) => {
            metrics::counter!(
                "processor_requests_total",
                "processor" => processor,
                "operation" => operation,
                "outcome" => if e.is_timeout() { "timeout" } else { "network_error" }
            )
            .increment(1);
            Err(ProcessorError::Network {
                processor,
                message: e.to_string(),
                timeout: e.is_timeout(),
            })
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
