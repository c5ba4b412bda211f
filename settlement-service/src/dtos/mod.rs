use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{Payment, PaymentMethod, PaymentStatus, ProcessorRefs};
use crate::services::Reconciliation;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1, message = "invoiceId is required"))]
    pub invoice_id: String,
    #[validate(length(min = 1, message = "method is required"))]
    pub method: String,
    pub amount: Decimal,
    #[validate(length(min = 6, max = 20, message = "payerPhone has an invalid length"))]
    pub payer_phone: Option<String>,
    #[validate(email(message = "payerEmail is not a valid email address"))]
    pub payer_email: Option<String>,
    #[validate(length(max = 500, message = "notes must be at most 500 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub payment_id: String,
    pub payment_number: String,
    pub status: PaymentStatus,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub correlation_id: String,
    pub processor_correlation: ProcessorRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: String,
    pub payment_number: String,
    pub invoice_id: String,
    pub client_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub processor_refs: ProcessorRefs,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
    pub late_callbacks: usize,
    pub invoice_credited: bool,
    pub created_at: String,
    pub updated_at: String,
    pub settled_at: Option<String>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            payment_number: payment.payment_number,
            invoice_id: payment.invoice_id,
            client_id: payment.client_id,
            amount: payment.amount,
            currency: payment.currency,
            method: payment.method,
            status: payment.status,
            processor_refs: payment.processor_refs,
            transaction_id: payment.transaction_id,
            failure_reason: payment.failure_reason,
            notes: payment.notes,
            late_callbacks: payment.late_callbacks.len(),
            invoice_credited: payment.invoice_credited,
            created_at: payment.created_at.try_to_rfc3339_string().unwrap_or_default(),
            updated_at: payment.updated_at.try_to_rfc3339_string().unwrap_or_default(),
            settled_at: payment
                .settled_at
                .and_then(|t| t.try_to_rfc3339_string().ok()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQueryResponse {
    pub payment_id: String,
    pub invoice_id: String,
    pub payment_status: PaymentStatus,
    pub processor_state: String,
    pub result_code: String,
    pub result_desc: String,
    pub changed: bool,
    /// Set while the processor is still working on the charge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl StatusQueryResponse {
    pub fn new(reconciliation: Reconciliation, retry_after_secs: u64) -> Self {
        use crate::services::processors::RemoteState;

        let (processor_state, retry_after_secs) = match reconciliation.remote_state {
            RemoteState::Succeeded => ("succeeded", None),
            RemoteState::Failed => ("failed", None),
            RemoteState::Processing => ("processing", Some(retry_after_secs)),
        };
        Self {
            payment_id: reconciliation.payment.id,
            invoice_id: reconciliation.payment.invoice_id,
            payment_status: reconciliation.payment.status,
            processor_state: processor_state.to_string(),
            result_code: reconciliation.result_code,
            result_desc: reconciliation.result_desc,
            changed: reconciliation.changed,
            retry_after_secs,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[validate(range(max = 604800, message = "olderThanSecs must be at most 7 days"))]
    pub older_than_secs: Option<u64>,
    #[validate(range(min = 1, max = 500, message = "limit must be between 1 and 500"))]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}
