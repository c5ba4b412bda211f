//! Processor webhooks.
//!
//! Public and not tenant-scoped. Processors retry on non-2xx, so anything
//! that was handled (including duplicates and ignored events) gets a 200.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;

use crate::{
    dtos::WebhookAck,
    models::PaymentMethod,
    services::{metrics, processors::paystack::SIGNATURE_HEADER, CallbackDisposition},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

/// M-Pesa STK push result callback.
pub async fn mobile_money_webhook(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    if !state.mpesa.verify_callback_token(query.token.as_deref()) {
        tracing::warn!("Mobile money callback rejected: bad callback token");
        metrics::record_webhook(PaymentMethod::MobileMoney, "rejected");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(WebhookAck::rejected("invalid callback token")),
        ));
    }

    let disposition = state
        .orchestrator
        .handle_callback(PaymentMethod::MobileMoney, &body)
        .await?;
    Ok(acknowledge(PaymentMethod::MobileMoney, disposition))
}

/// Paystack event webhook.
pub async fn card_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    if state.paystack.verifies_webhooks() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !state.paystack.verify_signature(&body, signature) {
            tracing::warn!(
                has_signature = signature.is_some(),
                "Card gateway webhook rejected: signature mismatch"
            );
            metrics::record_webhook(PaymentMethod::CardGateway, "rejected");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(WebhookAck::rejected("invalid signature")),
            ));
        }
    }

    let disposition = state
        .orchestrator
        .handle_callback(PaymentMethod::CardGateway, &body)
        .await?;
    Ok(acknowledge(PaymentMethod::CardGateway, disposition))
}

fn acknowledge(
    method: PaymentMethod,
    disposition: CallbackDisposition,
) -> (StatusCode, Json<WebhookAck>) {
    match disposition {
        CallbackDisposition::Applied(payment) => {
            tracing::info!(
                %method,
                payment_id = %payment.id,
                status = %payment.status,
                "Webhook applied"
            );
            (StatusCode::OK, Json(WebhookAck::ok()))
        }
        CallbackDisposition::Duplicate(payment) => {
            tracing::info!(
                %method,
                payment_id = %payment.id,
                status = %payment.status,
                "Duplicate webhook acknowledged"
            );
            (StatusCode::OK, Json(WebhookAck::ok()))
        }
        CallbackDisposition::Ignored(_) => (StatusCode::OK, Json(WebhookAck::ok())),
        CallbackDisposition::Unmatched(correlation_id) => (
            StatusCode::NOT_FOUND,
            Json(WebhookAck::rejected(format!(
                "no payment for {}",
                correlation_id
            ))),
        ),
        CallbackDisposition::Invalid(reason) => {
            (StatusCode::BAD_REQUEST, Json(WebhookAck::rejected(reason)))
        }
    }
}
