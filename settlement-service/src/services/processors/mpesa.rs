//! Safaricom M-Pesa Express (STK push) adapter.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use service_core::http::{RetryConfig, is_retryable_status, retry_with_backoff};
use service_core::utils::signature::constant_time_eq;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::http::{self as wire, RawResponse};
use super::{
    CallbackOutcome, ChargeRequest, ChargeResponse, PaymentProcessor, ProcessorError,
    ProcessorOutcome, RemoteState, StatusReport,
};
use crate::config::MpesaConfig;
use crate::models::{MobileMoneyRef, PaymentMethod, ProcessorRefs};
use crate::services::token_cache::{TokenCache, reuse_window};

const PROCESSOR: &str = "mpesa";
const TOKEN_KEY: &str = "mpesa:oauth";
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
/// Query error code Daraja returns while the payer has not answered the prompt.
pub const STILL_PROCESSING: &str = "500.001.1001";
/// Daraja timestamps are East Africa Time.
const EAT_OFFSET_HOURS: i64 = 3;
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3599);

pub struct MpesaClient {
    config: MpesaConfig,
    client: Client,
    tokens: Arc<dyn TokenCache>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<Value>,
    response_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<Value>,
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    result_code: Option<Value>,
    result_desc: Option<String>,
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<Value>,
}

impl CallbackMetadata {
    fn get(&self, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_ref())
    }
}

impl MpesaClient {
    pub fn new(
        config: MpesaConfig,
        timeout: Duration,
        retry: RetryConfig,
        tokens: Arc<dyn TokenCache>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            client: wire::build_client(timeout)?,
            tokens,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Whether an inbound callback carries the shared callback token, if one is configured.
    pub fn verify_callback_token(&self, provided: Option<&str>) -> bool {
        match &self.config.callback_token {
            None => true,
            Some(expected) => provided
                .map(|token| constant_time_eq(expected.expose_secret(), token))
                .unwrap_or(false),
        }
    }

    fn callback_url(&self, base: &str) -> Result<String, ProcessorError> {
        let mut url = Url::parse(base).map_err(|e| ProcessorError::Rejected {
            processor: PROCESSOR,
            code: None,
            message: format!("invalid callback URL '{}': {}", base, e),
        })?;
        if let Some(token) = &self.config.callback_token {
            url.query_pairs_mut()
                .append_pair("token", token.expose_secret());
        }
        Ok(url.to_string())
    }

    async fn access_token(&self) -> Result<String, ProcessorError> {
        if let Some(token) = self.tokens.get(TOKEN_KEY).await {
            return Ok(token);
        }

        let url = self.url("/oauth/v1/generate?grant_type=client_credentials");
        let raw = retry_with_backoff(&self.retry, "mpesa_oauth", || async {
            let request = self.client.get(&url).basic_auth(
                &self.config.consumer_key,
                Some(self.config.consumer_secret.expose_secret()),
            );
            wire::send(PROCESSOR, "oauth", request)
                .await?
                .ensure_success(PROCESSOR)
        })
        .await?;

        let token: TokenResponse = raw.json(PROCESSOR)?;
        if token.access_token.is_empty() {
            return Err(ProcessorError::InvalidResponse {
                processor: PROCESSOR,
                message: "empty access_token".to_string(),
            });
        }

        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(value_as_string)
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        self.tokens
            .put(TOKEN_KEY, &token.access_token, reuse_window(lifetime))
            .await;
        tracing::debug!(ttl_secs = reuse_window(lifetime).as_secs(), "Fetched M-Pesa access token");

        Ok(token.access_token)
    }

    /// POST an authorised JSON body. A 401 drops the cached token and retries once
    /// with a fresh one.
    async fn post_authorized(
        &self,
        operation: &'static str,
        path: &str,
        body: &Value,
    ) -> Result<RawResponse, ProcessorError> {
        let url = self.url(path);
        let mut refreshed = false;

        loop {
            let token = self.access_token().await?;
            let raw = retry_with_backoff(&self.retry, operation, || async {
                let request = self.client.post(&url).bearer_auth(&token).json(body);
                let raw = wire::send(PROCESSOR, operation, request).await?;
                if is_retryable_status(raw.status) && !is_still_processing(&raw) {
                    return raw.ensure_success(PROCESSOR);
                }
                Ok(raw)
            })
            .await?;

            if raw.status == StatusCode::UNAUTHORIZED && !refreshed {
                tracing::warn!(operation, "M-Pesa rejected access token, refreshing");
                self.tokens.invalidate(TOKEN_KEY).await;
                refreshed = true;
                continue;
            }
            return Ok(raw);
        }
    }

    fn password(&self, timestamp: &str) -> String {
        password(
            &self.config.shortcode,
            self.config.passkey.expose_secret(),
            timestamp,
        )
    }
}

/// `base64(shortcode + passkey + timestamp)`.
pub fn password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

/// Compact `YYYYMMDDHHMMSS` timestamp in East Africa Time.
pub fn timestamp_at(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(EAT_OFFSET_HOURS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

fn is_still_processing(raw: &RawResponse) -> bool {
    raw.json::<Value>(PROCESSOR)
        .ok()
        .and_then(|body| body.get("errorCode").and_then(value_as_string))
        .is_some_and(|code| code == STILL_PROCESSING)
}

/// Daraja mixes numeric and string encodings for the same fields.
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_decimal(value: &Value) -> Option<Decimal> {
    value_as_string(value).and_then(|s| Decimal::from_str(&s).ok())
}

fn whole_units(amount: Decimal) -> Result<u64, ProcessorError> {
    if !amount.fract().is_zero() {
        return Err(ProcessorError::Rejected {
            processor: PROCESSOR,
            code: None,
            message: format!("amount {} is not a whole number", amount),
        });
    }
    amount.to_u64().ok_or_else(|| ProcessorError::Rejected {
        processor: PROCESSOR,
        code: None,
        message: format!("amount {} is out of range", amount),
    })
}

/// Parse an STK callback body. Never fails; malformed input is `Invalid`.
pub fn parse_stk_callback(body: &[u8]) -> CallbackOutcome {
    let envelope: CallbackEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => return CallbackOutcome::Invalid(format!("malformed STK callback: {}", e)),
    };
    let callback = envelope.body.stk_callback;

    let Some(correlation_id) = callback.checkout_request_id.filter(|id| !id.is_empty()) else {
        return CallbackOutcome::Invalid("missing CheckoutRequestID".to_string());
    };
    let Some(result_code) = callback.result_code.as_ref().and_then(value_as_string) else {
        return CallbackOutcome::Invalid("missing ResultCode".to_string());
    };

    let metadata = callback.callback_metadata.as_ref();
    let raw = serde_json::from_slice(body).unwrap_or(Value::Null);

    CallbackOutcome::Resolved(ProcessorOutcome {
        correlation_id,
        success: result_code == "0",
        amount: metadata
            .and_then(|m| m.get("Amount"))
            .and_then(value_as_decimal),
        payer_identifier: metadata
            .and_then(|m| m.get("PhoneNumber"))
            .and_then(value_as_string),
        transaction_id: metadata
            .and_then(|m| m.get("MpesaReceiptNumber"))
            .and_then(value_as_string),
        description: callback.result_desc,
        raw,
    })
}

#[async_trait]
impl PaymentProcessor for MpesaClient {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::MobileMoney
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ProcessorError> {
        if !self.is_configured() {
            return Err(ProcessorError::NotConfigured {
                processor: PROCESSOR,
            });
        }

        let amount = whole_units(request.amount)?;
        let timestamp = timestamp_at(Utc::now());
        let body = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": TRANSACTION_TYPE,
            "Amount": amount,
            "PartyA": request.payer_identifier,
            "PartyB": self.config.shortcode,
            "PhoneNumber": request.payer_identifier,
            "CallBackURL": self.callback_url(&request.callback_url)?,
            "AccountReference": request.invoice_reference,
            "TransactionDesc": format!("Payment {}", request.payment_number),
        });

        let raw = self
            .post_authorized("stk_push", "/mpesa/stkpush/v1/processrequest", &body)
            .await?
            .ensure_success(PROCESSOR)?;
        let response: StkPushResponse = raw.json(PROCESSOR)?;

        let code = response
            .response_code
            .as_ref()
            .and_then(value_as_string)
            .unwrap_or_default();
        if code != "0" {
            return Err(ProcessorError::Rejected {
                processor: PROCESSOR,
                code: Some(code),
                message: response
                    .response_description
                    .unwrap_or_else(|| "STK push rejected".to_string()),
            });
        }

        let (Some(merchant_request_id), Some(checkout_request_id)) =
            (response.merchant_request_id, response.checkout_request_id)
        else {
            return Err(ProcessorError::InvalidResponse {
                processor: PROCESSOR,
                message: "STK push response missing request ids".to_string(),
            });
        };

        tracing::info!(
            payment_id = %request.payment_id,
            checkout_request_id = %checkout_request_id,
            "STK push accepted"
        );

        Ok(ChargeResponse {
            correlation_id: checkout_request_id.clone(),
            refs: ProcessorRefs {
                mobile_money: Some(MobileMoneyRef {
                    merchant_request_id,
                    checkout_request_id,
                }),
                card_gateway: None,
            },
            redirect_url: None,
            raw: raw.json_value(),
        })
    }

    fn parse_callback(&self, body: &[u8]) -> CallbackOutcome {
        parse_stk_callback(body)
    }

    async fn query_status(&self, correlation_id: &str) -> Result<StatusReport, ProcessorError> {
        if !self.is_configured() {
            return Err(ProcessorError::NotConfigured {
                processor: PROCESSOR,
            });
        }

        let timestamp = timestamp_at(Utc::now());
        let body = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": correlation_id,
        });

        let raw = self
            .post_authorized("stk_query", "/mpesa/stkpushquery/v1/query", &body)
            .await?;

        if is_still_processing(&raw) {
            let payload = raw.json_value();
            return Ok(StatusReport {
                state: RemoteState::Processing,
                result_code: STILL_PROCESSING.to_string(),
                result_desc: payload
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("The transaction is being processed")
                    .to_string(),
                transaction_id: None,
                amount: None,
                raw: payload,
            });
        }

        let raw = raw.ensure_success(PROCESSOR)?;
        let response: StkQueryResponse = raw.json(PROCESSOR)?;
        let Some(result_code) = response.result_code.as_ref().and_then(value_as_string) else {
            return Err(ProcessorError::InvalidResponse {
                processor: PROCESSOR,
                message: "STK query response missing ResultCode".to_string(),
            });
        };

        let state = if result_code == "0" {
            RemoteState::Succeeded
        } else {
            RemoteState::Failed
        };

        Ok(StatusReport {
            state,
            result_code,
            result_desc: response.result_desc.unwrap_or_default(),
            transaction_id: None,
            amount: None,
            raw: raw.json_value(),
        })
    }
}
