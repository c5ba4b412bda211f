//! Paystack transaction adapter (card and bank via hosted checkout).

use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use service_core::http::{RetryConfig, retry_with_backoff};
use service_core::utils::signature::verify_hmac_sha512;
use std::time::Duration;

use super::http as wire;
use super::{
    CallbackOutcome, ChargeRequest, ChargeResponse, PaymentProcessor, ProcessorError,
    ProcessorOutcome, RemoteState, StatusReport,
};
use crate::config::PaystackConfig;
use crate::models::{CardGatewayRef, PaymentMethod, ProcessorRefs};

const PROCESSOR: &str = "paystack";
/// Paystack amounts are in the minor unit (kobo, cents).
const MINOR_UNITS: i64 = 100;
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

pub struct PaystackClient {
    config: PaystackConfig,
    client: Client,
    retry: RetryConfig,
}

/// Paystack wraps every response in `{status, message, data}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: Option<String>,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    id: Option<Value>,
    status: Option<String>,
    reference: Option<String>,
    amount: Option<Value>,
    gateway_response: Option<String>,
    customer: Option<Customer>,
}

#[derive(Debug, Deserialize)]
struct Customer {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: Option<String>,
    data: Option<TransactionData>,
}

impl PaystackClient {
    pub fn new(config: PaystackConfig, timeout: Duration, retry: RetryConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            client: wire::build_client(timeout)?,
            retry,
        })
    }

    pub fn verifies_webhooks(&self) -> bool {
        self.config.verify_webhooks
    }

    /// Check `x-paystack-signature` (HMAC-SHA512 of the raw body keyed by the secret key).
    pub fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> bool {
        match signature {
            Some(signature) => {
                verify_hmac_sha512(self.config.secret_key.expose_secret(), body, signature)
                    .unwrap_or(false)
            }
            None => false,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(T, Value), ProcessorError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let raw = retry_with_backoff(&self.retry, operation, || async {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(self.config.secret_key.expose_secret());
            if let Some(body) = body {
                request = request.json(body);
            }
            wire::send(PROCESSOR, operation, request)
                .await?
                .ensure_success(PROCESSOR)
        })
        .await?;

        let envelope: Envelope<T> = raw.json(PROCESSOR)?;
        if !envelope.status {
            return Err(ProcessorError::Rejected {
                processor: PROCESSOR,
                code: None,
                message: envelope.message,
            });
        }
        let data = envelope.data.ok_or_else(|| ProcessorError::InvalidResponse {
            processor: PROCESSOR,
            message: format!("{} response has no data", operation),
        })?;
        Ok((data, raw.json_value()))
    }

    /// An initialize retried after a lost response is refused as a duplicate
    /// reference. If verify finds the transaction, the earlier attempt went
    /// through and the payment carries on without a checkout URL.
    async fn adopt_initialized(
        &self,
        request: &ChargeRequest,
        rejection: ProcessorError,
    ) -> Result<ChargeResponse, ProcessorError> {
        let reference = request.payment_number.clone();
        let path = format!("/transaction/verify/{}", reference);
        let (data, raw): (TransactionData, Value) =
            match self.call("verify", Method::GET, &path, None).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        payment_id = %request.payment_id,
                        %reference,
                        error = %e,
                        "Duplicate Paystack reference could not be verified"
                    );
                    return Err(rejection);
                }
            };

        if data.reference.as_deref().is_some_and(|r| r != reference) {
            return Err(ProcessorError::InvalidResponse {
                processor: PROCESSOR,
                message: format!("verify for {} returned another reference", reference),
            });
        }

        tracing::warn!(
            payment_id = %request.payment_id,
            %reference,
            status = data.status.as_deref().unwrap_or("unknown"),
            "Paystack reference already initialized, reusing it"
        );

        Ok(ChargeResponse {
            correlation_id: reference.clone(),
            redirect_url: None,
            refs: ProcessorRefs {
                mobile_money: None,
                card_gateway: Some(CardGatewayRef {
                    reference,
                    authorization_url: None,
                    access_code: None,
                }),
            },
            raw,
        })
    }
}

fn is_duplicate_reference(error: &ProcessorError) -> bool {
    let message = match error {
        ProcessorError::Http {
            status: 400, body, ..
        } => body,
        ProcessorError::Rejected { message, .. } => message,
        _ => return false,
    };
    message.to_ascii_lowercase().contains("duplicate")
}

pub fn to_minor_units(amount: Decimal) -> Result<i64, ProcessorError> {
    (amount * Decimal::from(MINOR_UNITS))
        .round()
        .to_i64()
        .ok_or_else(|| ProcessorError::Rejected {
            processor: PROCESSOR,
            code: None,
            message: format!("amount {} is out of range", amount),
        })
}

pub fn from_minor_units(value: &Value) -> Option<Decimal> {
    let minor = match value {
        Value::Number(n) => n.as_i64().map(Decimal::from),
        Value::String(s) => s.trim().parse::<i64>().ok().map(Decimal::from),
        _ => None,
    }?;
    Some(minor / Decimal::from(MINOR_UNITS))
}

/// `abandoned` only means the payer has not finished checkout yet; like
/// `ongoing`, `pending`, `processing` and `queued` it can still succeed.
fn is_final_failure(status: &str) -> bool {
    matches!(status, "failed" | "reversed")
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse a webhook body. Only charge events settle payments; everything else is
/// acknowledged and ignored.
pub fn parse_webhook(body: &[u8]) -> CallbackOutcome {
    let raw: Value = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => return CallbackOutcome::Invalid(format!("malformed webhook: {}", e)),
    };
    let event: WebhookEvent = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(e) => return CallbackOutcome::Invalid(format!("unexpected webhook shape: {}", e)),
    };

    let Some(data) = event.data else {
        return CallbackOutcome::Invalid("webhook has no data".to_string());
    };
    if event.event.is_none() && data.status.is_none() {
        return CallbackOutcome::Invalid("webhook has neither event nor status".to_string());
    }
    let Some(reference) = data.reference.filter(|r| !r.is_empty()) else {
        return CallbackOutcome::Invalid("webhook has no transaction reference".to_string());
    };

    let success = match (event.event.as_deref(), data.status.as_deref()) {
        (Some("charge.success"), _) => true,
        (Some("charge.failed"), _) => false,
        (Some(other), _) if !other.starts_with("charge.") => {
            return CallbackOutcome::Ignored(format!("event {} is not a charge outcome", other));
        }
        (_, Some("success")) => true,
        (_, Some(status)) if is_final_failure(status) => false,
        (event, status) => {
            return CallbackOutcome::Ignored(format!(
                "non-terminal webhook (event {:?}, status {:?})",
                event, status
            ));
        }
    };

    CallbackOutcome::Resolved(ProcessorOutcome {
        correlation_id: reference,
        success,
        amount: data.amount.as_ref().and_then(from_minor_units),
        payer_identifier: data.customer.and_then(|c| c.email),
        transaction_id: data.id.as_ref().and_then(id_string),
        description: data.gateway_response,
        raw,
    })
}

#[async_trait]
impl PaymentProcessor for PaystackClient {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::CardGateway
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

        let payload = json!({
            "email": request.payer_identifier,
            "amount": to_minor_units(request.amount)?,
            "currency": self.config.currency,
            "reference": request.payment_number,
            "callback_url": request.callback_url,
            "metadata": {
                "payment_id": request.payment_id,
                "invoice": request.invoice_reference,
            },
        });

        let initialized = self
            .call(
                "initialize",
                Method::POST,
                "/transaction/initialize",
                Some(&payload),
            )
            .await;
        let (data, raw): (InitializeData, Value) = match initialized {
            Ok(initialized) => initialized,
            Err(e) if is_duplicate_reference(&e) => return self.adopt_initialized(request, e).await,
            Err(e) => return Err(e),
        };

        tracing::info!(
            payment_id = %request.payment_id,
            reference = %data.reference,
            "Paystack transaction initialized"
        );

        Ok(ChargeResponse {
            correlation_id: data.reference.clone(),
            redirect_url: Some(data.authorization_url.clone()),
            refs: ProcessorRefs {
                mobile_money: None,
                card_gateway: Some(CardGatewayRef {
                    reference: data.reference,
                    authorization_url: Some(data.authorization_url),
                    access_code: data.access_code,
                }),
            },
            raw,
        })
    }

    fn parse_callback(&self, body: &[u8]) -> CallbackOutcome {
        parse_webhook(body)
    }

    async fn query_status(&self, correlation_id: &str) -> Result<StatusReport, ProcessorError> {
        if !self.is_configured() {
            return Err(ProcessorError::NotConfigured {
                processor: PROCESSOR,
            });
        }

        let path = format!("/transaction/verify/{}", correlation_id);
        let (data, raw): (TransactionData, Value) =
            self.call("verify", Method::GET, &path, None).await?;

        let status = data.status.unwrap_or_default();
        let state = match status.as_str() {
            "success" => RemoteState::Succeeded,
            s if is_final_failure(s) => RemoteState::Failed,
            _ => RemoteState::Processing,
        };

        Ok(StatusReport {
            state,
            result_desc: data.gateway_response.unwrap_or_else(|| status.clone()),
            result_code: status,
            transaction_id: data.id.as_ref().and_then(id_string),
            amount: data.amount.as_ref().and_then(from_minor_units),
            raw,
        })
    }
}
