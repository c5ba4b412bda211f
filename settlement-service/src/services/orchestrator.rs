//! Payment state machine.
//!
//! A payment is created `pending` and leaves that state exactly once, to
//! `completed` or `failed`, through [`PaymentStore::transition`]. Only the
//! caller that wins that conditional write settles the payment, so duplicate
//! webhooks and webhook/poll races are absorbed as no-ops.
//!
//! Crediting the invoice is a second step. A completed payment carries
//! `invoice_credited = false` until the ledger write succeeds, and any later
//! webhook, poll or sweep that finds it in that state retries the credit. The
//! ledger ignores a payment it has already counted, and only the caller that
//! flips the flag publishes events and notifies the payer.

use chrono::Datelike;
use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::error::PaymentError;
use super::events::EventBroadcaster;
use super::invoices::InvoiceStore;
use super::ledger;
use super::metrics;
use super::notifications::{NotificationComposer, NotificationSink};
use super::processors::{
    CallbackOutcome, ChargeRequest, PaymentProcessor, ProcessorOutcome, ProcessorRegistry,
    RemoteState,
};
use super::repository::PaymentStore;
use crate::models::{
    format_payment_number, Invoice, InvoiceStatus, Payment, PaymentEvent, PaymentMethod,
    PaymentSelector, PaymentStatus, StatusTransition, TransitionOutcome,
};
use crate::utils::normalize_msisdn;

const NEVER_ACKNOWLEDGED: &str = "processor never acknowledged the charge";
const DEFAULT_FAILURE_REASON: &str = "payment was not completed";

/// A request to charge part or all of an invoice.
#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub invoice_id: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub payer_phone: Option<String>,
    pub payer_email: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub payment: Payment,
    pub correlation_id: String,
    pub redirect_url: Option<String>,
}

/// What applying a processor outcome did.
#[derive(Debug, Clone)]
pub enum ApplyResult {
    Applied(Payment),
    /// The payment was already terminal; nothing changed.
    Duplicate(Payment),
    NotFound,
}

/// How an inbound webhook was handled.
#[derive(Debug, Clone)]
pub enum CallbackDisposition {
    Applied(Payment),
    Duplicate(Payment),
    Unmatched(String),
    Ignored(String),
    Invalid(String),
}

impl CallbackDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            CallbackDisposition::Applied(_) => "applied",
            CallbackDisposition::Duplicate(_) => "duplicate",
            CallbackDisposition::Unmatched(_) => "unmatched",
            CallbackDisposition::Ignored(_) => "ignored",
            CallbackDisposition::Invalid(_) => "invalid",
        }
    }
}

/// Result of actively polling a processor for one payment.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub payment: Payment,
    pub remote_state: RemoteState,
    pub result_code: String,
    pub result_desc: String,
    /// Whether this poll moved the payment out of `pending` or finished
    /// crediting its invoice.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    /// Completed payments whose invoice credit was finished by this sweep.
    pub credited: usize,
    pub errors: usize,
}

pub struct PaymentOrchestrator {
    payments: Arc<dyn PaymentStore>,
    invoices: Arc<dyn InvoiceStore>,
    notifications: Arc<dyn NotificationSink>,
    events: Arc<dyn EventBroadcaster>,
    processors: ProcessorRegistry,
    composer: NotificationComposer,
    callback_base_url: String,
    app_base_url: String,
}

impl PaymentOrchestrator {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        invoices: Arc<dyn InvoiceStore>,
        notifications: Arc<dyn NotificationSink>,
        events: Arc<dyn EventBroadcaster>,
        processors: ProcessorRegistry,
        callback_base_url: &str,
        app_base_url: &str,
    ) -> Self {
        Self {
            payments,
            invoices,
            notifications,
            events,
            processors,
            composer: NotificationComposer::new(app_base_url),
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
            app_base_url: app_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn processor(&self, method: PaymentMethod) -> Result<&Arc<dyn PaymentProcessor>, PaymentError> {
        self.processors
            .get(method)
            .ok_or(PaymentError::ProcessorNotConfigured(method))
    }

    /// Where the processor sends the payer or its callback for this charge.
    fn callback_url(&self, payment: &Payment) -> String {
        match payment.method {
            PaymentMethod::MobileMoney => {
                format!("{}/payments/webhooks/mobile-money", self.callback_base_url)
            }
            PaymentMethod::CardGateway => format!(
                "{}/invoices/{}?payment={}",
                self.app_base_url, payment.invoice_id, payment.id
            ),
        }
    }

    /// Validate, create a pending payment and ask the processor to charge it.
    ///
    /// If the processor call fails the payment stays `pending` with no
    /// correlation id; the reconciliation sweep fails it later.
    pub async fn initiate(
        &self,
        org_id: &str,
        initiated_by: Option<String>,
        request: InitiatePayment,
    ) -> Result<InitiatedPayment, PaymentError> {
        let invoice = self
            .invoices
            .get_in_tenant(org_id, &request.invoice_id)
            .await?
            .ok_or_else(|| PaymentError::InvoiceNotFound(request.invoice_id.clone()))?;

        match invoice.status {
            InvoiceStatus::Cancelled => {
                return Err(PaymentError::Conflict(format!(
                    "Invoice {} is cancelled",
                    invoice.invoice_number
                )));
            }
            _ if invoice.is_fully_paid() => {
                return Err(PaymentError::Conflict(format!(
                    "Invoice {} is already fully paid",
                    invoice.invoice_number
                )));
            }
            _ => {}
        }

        validate_amount(&invoice, request.amount)?;
        let (payer_phone, payer_email, payer_identifier) = payer_contact(&invoice, &request)?;

        let processor = self.processor(request.method)?;
        if !processor.is_configured() {
            return Err(PaymentError::ProcessorNotConfigured(request.method));
        }

        let year = chrono::Utc::now().year();
        let sequence = self.payments.next_sequence(year).await?;
        let mut payment = Payment::new_pending(
            format_payment_number(year, sequence),
            invoice.org_id.clone(),
            invoice.id.clone(),
            invoice.client_id.clone(),
            initiated_by,
            request.amount,
            invoice.currency.clone(),
            request.method,
            payer_phone,
            payer_email,
        );
        payment.notes = request.notes;
        self.payments.insert(&payment).await?;
        metrics::record_initiated(payment.method);

        tracing::info!(
            payment_id = %payment.id,
            payment_number = %payment.payment_number,
            invoice_id = %invoice.id,
            method = %payment.method,
            amount = %payment.amount,
            "Payment created, requesting charge"
        );

        let charge = ChargeRequest {
            amount: payment.amount,
            payer_identifier,
            invoice_reference: invoice.invoice_number.clone(),
            payment_id: payment.id.clone(),
            payment_number: payment.payment_number.clone(),
            callback_url: self.callback_url(&payment),
        };

        let response = match processor.charge(&charge).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    payment_id = %payment.id,
                    method = %payment.method,
                    error = %e,
                    "Charge request failed, payment left pending"
                );
                return Err(e.into());
            }
        };

        self.payments
            .set_processor_refs(&payment.id, &response.refs)
            .await?;
        payment.processor_refs = response.refs;

        self.events.publish(PaymentEvent::payment_updated(&payment));

        Ok(InitiatedPayment {
            payment,
            correlation_id: response.correlation_id,
            redirect_url: response.redirect_url,
        })
    }

    /// Apply a terminal processor outcome to the payment it correlates to.
    pub async fn apply_outcome(
        &self,
        method: PaymentMethod,
        outcome: ProcessorOutcome,
    ) -> Result<ApplyResult, PaymentError> {
        let selector = PaymentSelector::Correlation {
            method,
            correlation_id: outcome.correlation_id.clone(),
        };
        let transition = if outcome.success {
            StatusTransition::completed(outcome.transaction_id.clone(), outcome.raw.clone())
        } else {
            StatusTransition::failed(
                outcome
                    .description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
                Some(outcome.raw.clone()),
            )
        };

        match self.payments.transition(&selector, &transition).await? {
            TransitionOutcome::Applied(payment) => {
                match outcome.amount {
                    Some(reported) if reported != payment.amount => tracing::warn!(
                        payment_id = %payment.id,
                        expected = %payment.amount,
                        reported = %reported,
                        "Processor reported a different amount"
                    ),
                    _ => {}
                }
                self.settle(payment).await.map(ApplyResult::Applied)
            }
            TransitionOutcome::AlreadyTerminal(payment) => {
                tracing::info!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    %selector,
                    reported_success = outcome.success,
                    "Outcome for terminal payment ignored"
                );
                self.payments
                    .record_late_callback(&payment.id, outcome.raw)
                    .await?;
                if !payment.awaits_invoice_credit() {
                    return Ok(ApplyResult::Duplicate(payment));
                }
                match self.credit_invoice(payment).await? {
                    (payment, true) => Ok(ApplyResult::Applied(payment)),
                    (payment, false) => Ok(ApplyResult::Duplicate(payment)),
                }
            }
            TransitionOutcome::NotFound => {
                tracing::warn!(%selector, "Outcome does not match any payment");
                Ok(ApplyResult::NotFound)
            }
        }
    }

    /// Side effects of a transition this caller won.
    async fn settle(&self, payment: Payment) -> Result<Payment, PaymentError> {
        metrics::record_settled(payment.method, payment.status);

        if payment.status == PaymentStatus::Completed {
            let (payment, _) = self.credit_invoice(payment).await?;
            return Ok(payment);
        }

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %payment.invoice_id,
            status = %payment.status,
            "Payment settled"
        );
        self.fan_out(&payment, None).await;
        Ok(payment)
    }

    /// Credit the invoice for a completed payment and mark the payment
    /// credited. The flag is only set once the ledger write has succeeded.
    ///
    /// Returns `true` when this caller flipped the flag; only then are
    /// events published and the payer notified.
    async fn credit_invoice(&self, mut payment: Payment) -> Result<(Payment, bool), PaymentError> {
        let invoice = match ledger::apply_completed_payment(self.invoices.as_ref(), &payment).await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::error!(
                    payment_id = %payment.id,
                    invoice_id = %payment.invoice_id,
                    error = %e,
                    "Payment completed but invoice was not credited"
                );
                return Err(e);
            }
        };

        if !self.payments.mark_invoice_credited(&payment.id).await? {
            tracing::debug!(payment_id = %payment.id, "Invoice credit already recorded");
            return Ok((payment, false));
        }
        payment.invoice_credited = true;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %payment.invoice_id,
            status = %payment.status,
            paid_amount = %invoice.paid_amount,
            "Payment settled"
        );
        self.fan_out(&payment, Some(&invoice)).await;
        Ok((payment, true))
    }

    /// Events and payer notification. Failures here never undo the settlement.
    async fn fan_out(&self, payment: &Payment, invoice: Option<&Invoice>) {
        self.events.publish(PaymentEvent::payment_updated(payment));
        if let Some(invoice) = invoice {
            self.events.publish(PaymentEvent::invoice_updated(invoice));
        }

        let notification = match payment.status {
            PaymentStatus::Completed => self.composer.payment_received(payment),
            PaymentStatus::Failed => self.composer.payment_failed(payment),
            PaymentStatus::Pending => return,
        };
        if let Err(e) = self.notifications.notify(notification).await {
            tracing::warn!(
                payment_id = %payment.id,
                error = %e,
                "Failed to deliver payment notification"
            );
        }
    }

    /// Parse and apply an inbound webhook body.
    pub async fn handle_callback(
        &self,
        method: PaymentMethod,
        body: &[u8],
    ) -> Result<CallbackDisposition, PaymentError> {
        let processor = self.processor(method)?;

        let disposition = match processor.parse_callback(body) {
            CallbackOutcome::Invalid(reason) => {
                tracing::warn!(%method, %reason, "Rejected malformed webhook");
                CallbackDisposition::Invalid(reason)
            }
            CallbackOutcome::Ignored(reason) => {
                tracing::debug!(%method, %reason, "Ignored webhook");
                CallbackDisposition::Ignored(reason)
            }
            CallbackOutcome::Resolved(outcome) => {
                let correlation_id = outcome.correlation_id.clone();
                match self.apply_outcome(method, outcome).await? {
                    ApplyResult::Applied(payment) => CallbackDisposition::Applied(payment),
                    ApplyResult::Duplicate(payment) => CallbackDisposition::Duplicate(payment),
                    ApplyResult::NotFound => CallbackDisposition::Unmatched(correlation_id),
                }
            }
        };

        metrics::record_webhook(method, disposition.label());
        Ok(disposition)
    }

    /// Ask the processor where a charge stands and reconcile the local payment.
    ///
    /// When `org_id` is given the payment must belong to that tenant.
    pub async fn query_and_reconcile(
        &self,
        method: PaymentMethod,
        correlation_id: &str,
        org_id: Option<&str>,
    ) -> Result<Reconciliation, PaymentError> {
        let payment = self
            .payments
            .find_by_correlation(method, correlation_id)
            .await?
            .filter(|p| org_id.is_none_or(|org| p.org_id == org))
            .ok_or_else(|| PaymentError::PaymentNotFound(correlation_id.to_string()))?;

        let processor = self.processor(method)?;
        let report = processor.query_status(correlation_id).await?;
        let remote_state = report.state;
        let result_code = report.result_code.clone();
        let result_desc = report.result_desc.clone();

        let wanted = match remote_state {
            RemoteState::Succeeded => Some(PaymentStatus::Completed),
            RemoteState::Failed => Some(PaymentStatus::Failed),
            RemoteState::Processing => None,
        };

        let (payment, changed) = match (wanted, report.into_outcome(correlation_id)) {
            _ if payment.awaits_invoice_credit() => self.credit_invoice(payment).await?,
            (Some(status), Some(outcome)) if payment.status != status => {
                match self.apply_outcome(method, outcome).await? {
                    ApplyResult::Applied(updated) => (updated, true),
                    ApplyResult::Duplicate(current) => (current, false),
                    ApplyResult::NotFound => {
                        return Err(PaymentError::PaymentNotFound(correlation_id.to_string()));
                    }
                }
            }
            _ => (payment, false),
        };

        tracing::info!(
            payment_id = %payment.id,
            correlation_id,
            ?remote_state,
            %result_code,
            changed,
            "Payment status polled"
        );

        Ok(Reconciliation {
            payment,
            remote_state,
            result_code,
            result_desc,
            changed,
        })
    }

    /// Resolve pending payments older than `older_than`.
    ///
    /// Payments the processor never acknowledged are failed; the rest are polled.
    /// Completed payments settled before the same cutoff whose invoice credit
    /// never went through are credited again.
    pub async fn sweep_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<SweepSummary, PaymentError> {
        let cutoff = DateTime::from_millis(
            DateTime::now().timestamp_millis() - older_than.as_millis() as i64,
        );
        let stale = self.payments.list_stale_pending(cutoff, limit).await?;
        let mut summary = SweepSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for payment in stale {
            let status = match payment.correlation_id().map(str::to_string) {
                None => self.fail_unacknowledged(payment).await,
                Some(correlation_id) => self
                    .query_and_reconcile(payment.method, &correlation_id, None)
                    .await
                    .map(|r| r.payment.status),
            };

            match status {
                Ok(PaymentStatus::Completed) => summary.completed += 1,
                Ok(PaymentStatus::Failed) => summary.failed += 1,
                Ok(PaymentStatus::Pending) => summary.still_pending += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "Reconciliation of stale payment failed");
                    summary.errors += 1;
                }
            }
        }

        let uncredited = self.payments.list_uncredited(cutoff, limit).await?;
        summary.examined += uncredited.len();
        for payment in uncredited {
            match self.credit_invoice(payment).await {
                Ok((_, true)) => summary.credited += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Retrying invoice credit failed");
                    summary.errors += 1;
                }
            }
        }

        if summary.examined > 0 {
            tracing::info!(?summary, "Pending payment sweep finished");
        }
        Ok(summary)
    }

    async fn fail_unacknowledged(&self, payment: Payment) -> Result<PaymentStatus, PaymentError> {
        let transition = StatusTransition::failed(NEVER_ACKNOWLEDGED, None);
        match self
            .payments
            .transition(&PaymentSelector::Id(payment.id.clone()), &transition)
            .await?
        {
            TransitionOutcome::Applied(failed) => {
                let failed = self.settle(failed).await?;
                Ok(failed.status)
            }
            TransitionOutcome::AlreadyTerminal(current) => Ok(current.status),
            TransitionOutcome::NotFound => Err(PaymentError::PaymentNotFound(payment.id)),
        }
    }

    pub async fn get_payment(&self, org_id: &str, id: &str) -> Result<Payment, PaymentError> {
        self.payments
            .get_in_tenant(org_id, id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(id.to_string()))
    }

    /// Delete a payment that never completed.
    pub async fn delete_payment(&self, org_id: &str, id: &str) -> Result<(), PaymentError> {
        let payment = self.get_payment(org_id, id).await?;
        if payment.status == PaymentStatus::Completed {
            return Err(PaymentError::Conflict(format!(
                "Payment {} is completed and cannot be deleted",
                payment.payment_number
            )));
        }
        if !self.payments.delete_unless_completed(id).await? {
            return Err(PaymentError::Conflict(format!(
                "Payment {} can no longer be deleted",
                payment.payment_number
            )));
        }
        tracing::info!(payment_id = %id, status = %payment.status, "Payment deleted");
        Ok(())
    }
}

fn validate_amount(invoice: &Invoice, amount: Decimal) -> Result<(), PaymentError> {
    if amount <= Decimal::ZERO {
        return Err(PaymentError::Validation(
            "Amount must be greater than zero".to_string(),
        ));
    }
    let balance = invoice.balance();
    if amount > balance {
        return Err(PaymentError::Validation(format!(
            "Amount {} exceeds the remaining balance of {}",
            amount, balance
        )));
    }
    Ok(())
}

/// Returns `(payer_phone, payer_email, processor payer identifier)`.
fn payer_contact(
    invoice: &Invoice,
    request: &InitiatePayment,
) -> Result<(Option<String>, Option<String>, String), PaymentError> {
    match request.method {
        PaymentMethod::MobileMoney => {
            if !request.amount.fract().is_zero() {
                return Err(PaymentError::Validation(
                    "Mobile money amounts must be whole units".to_string(),
                ));
            }
            let raw = request
                .payer_phone
                .as_deref()
                .or(invoice.client_phone.as_deref())
                .ok_or_else(|| {
                    PaymentError::Validation("A payer phone number is required".to_string())
                })?;
            let phone = normalize_msisdn(raw).map_err(PaymentError::Validation)?;
            Ok((Some(phone.clone()), None, phone))
        }
        PaymentMethod::CardGateway => {
            let email = request
                .payer_email
                .clone()
                .or_else(|| invoice.client_email.clone())
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| {
                    PaymentError::Validation("A payer email address is required".to_string())
                })?;
            Ok((None, Some(email.clone()), email))
        }
    }
}
