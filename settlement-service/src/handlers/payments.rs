//! Tenant-facing payment endpoints.
//!
//! Every operation except the reconciliation sweep is scoped to the
//! organisation from the request's [`TenantContext`].

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use std::time::Duration;
use validator::Validate;

use crate::{
    dtos::{
        InitiatePaymentRequest, InitiatePaymentResponse, PaymentResponse, ReconcileRequest,
        StatusQueryResponse,
    },
    middleware::TenantContext,
    models::PaymentMethod,
    services::{InitiatePayment, SweepSummary},
    AppState,
};

/// Suggested wait before polling a charge that is still processing.
const RETRY_AFTER_SECS: u64 = 15;
const DEFAULT_SWEEP_LIMIT: i64 = 100;

/// Start a payment against an invoice.
///
/// Returns `202 Accepted`: the payment is `pending` until the processor
/// reports an outcome by webhook or status poll.
pub async fn initiate_payment(
    State(state): State<AppState>,
    tenant: TenantContext,
    payload: Result<Json<InitiatePaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    let Json(payload) = payload.map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(anyhow::Error::new(e)))?;

    let method: PaymentMethod = payload
        .method
        .parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?;

    tracing::info!(
        org_id = %tenant.org_id,
        invoice_id = %payload.invoice_id,
        %method,
        amount = %payload.amount,
        "Initiating payment"
    );

    let initiated = state
        .orchestrator
        .initiate(
            &tenant.org_id,
            tenant.user_id.clone(),
            InitiatePayment {
                invoice_id: payload.invoice_id,
                method,
                amount: payload.amount,
                payer_phone: payload.payer_phone,
                payer_email: payload.payer_email,
                notes: payload.notes,
            },
        )
        .await?;

    let payment = initiated.payment;
    Ok((
        StatusCode::ACCEPTED,
        Json(InitiatePaymentResponse {
            payment_id: payment.id,
            payment_number: payment.payment_number,
            status: payment.status,
            method: payment.method,
            amount: payment.amount,
            correlation_id: initiated.correlation_id,
            processor_correlation: payment.processor_refs,
            redirect_url: initiated.redirect_url,
        }),
    ))
}

pub async fn get_payment(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .orchestrator
        .get_payment(&tenant.org_id, &payment_id)
        .await?;
    Ok(Json(PaymentResponse::from(payment)))
}

/// Delete a payment that has not completed.
pub async fn delete_payment(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(payment_id): Path<String>,
) -> Result<StatusCode, AppError> {
    tracing::info!(
        payment_id = %payment_id,
        org_id = %tenant.org_id,
        "Deleting payment"
    );
    state
        .orchestrator
        .delete_payment(&tenant.org_id, &payment_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Poll the mobile-money processor for an STK push and reconcile.
pub async fn mobile_money_status(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(correlation_id): Path<String>,
) -> Result<Json<StatusQueryResponse>, AppError> {
    poll_status(&state, &tenant, PaymentMethod::MobileMoney, &correlation_id).await
}

/// Verify a card-gateway transaction by reference and reconcile.
pub async fn card_gateway_status(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(reference): Path<String>,
) -> Result<Json<StatusQueryResponse>, AppError> {
    poll_status(&state, &tenant, PaymentMethod::CardGateway, &reference).await
}

async fn poll_status(
    state: &AppState,
    tenant: &TenantContext,
    method: PaymentMethod,
    correlation_id: &str,
) -> Result<Json<StatusQueryResponse>, AppError> {
    let reconciliation = state
        .orchestrator
        .query_and_reconcile(method, correlation_id, Some(&tenant.org_id))
        .await?;
    Ok(Json(StatusQueryResponse::new(
        reconciliation,
        RETRY_AFTER_SECS,
    )))
}

/// Operator endpoint: resolve stale pending payments now.
pub async fn reconcile_pending(
    State(state): State<AppState>,
    payload: Option<Json<ReconcileRequest>>,
) -> Result<Json<SweepSummary>, AppError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    request
        .validate()
        .map_err(|e| AppError::BadRequest(anyhow::Error::new(e)))?;

    let older_than = request
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.reconciliation.pending_after());
    let limit = request.limit.unwrap_or(DEFAULT_SWEEP_LIMIT);

    let summary = state.orchestrator.sweep_pending(older_than, limit).await?;
    Ok(Json(summary))
}
