//! Applies settled payments to invoice balances.
//!
//! The invoice records which payments it has counted, so
//! [`apply_completed_payment`] can be retried after a failed or interrupted
//! credit without counting a payment twice.

use super::error::PaymentError;
use super::invoices::InvoiceStore;
use crate::models::{Invoice, Payment};

const MAX_VERSION_CONFLICTS: usize = 5;

/// Credit `payment.amount` to its invoice and reclassify the invoice status.
pub async fn apply_completed_payment(
    invoices: &dyn InvoiceStore,
    payment: &Payment,
) -> Result<Invoice, PaymentError> {
    for attempt in 0..MAX_VERSION_CONFLICTS {
        let mut invoice = invoices
            .get(&payment.invoice_id)
            .await?
            .ok_or_else(|| PaymentError::InvoiceNotFound(payment.invoice_id.clone()))?;

        let expected_version = invoice.version;
        if !invoice.record_payment(&payment.id, payment.amount) {
            tracing::debug!(
                invoice_id = %invoice.id,
                payment_id = %payment.id,
                "Invoice already credited for payment"
            );
            return Ok(invoice);
        }

        if invoices.replace_if_version(&invoice, expected_version).await? {
            tracing::info!(
                invoice_id = %invoice.id,
                payment_id = %payment.id,
                paid_amount = %invoice.paid_amount,
                status = %invoice.status,
                "Invoice credited"
            );
            return Ok(invoice);
        }

        tracing::debug!(
            invoice_id = %invoice.id,
            attempt = attempt + 1,
            "Invoice version conflict, reloading"
        );
    }

    Err(PaymentError::Storage(anyhow::anyhow!(
        "invoice {} kept changing while crediting payment {}",
        payment.invoice_id,
        payment.id
    )))
}
