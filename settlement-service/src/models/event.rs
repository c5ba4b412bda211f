use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Invoice, InvoiceStatus, Payment, PaymentMethod, PaymentStatus};

/// Real-time status events fanned out to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum PaymentEvent {
    #[serde(rename = "payment.updated")]
    PaymentUpdated {
        org_id: String,
        payment_id: String,
        payment_number: String,
        invoice_id: String,
        method: PaymentMethod,
        status: PaymentStatus,
        amount: Decimal,
    },
    #[serde(rename = "invoice.updated")]
    InvoiceUpdated {
        org_id: String,
        invoice_id: String,
        status: InvoiceStatus,
        paid_amount: Decimal,
        balance: Decimal,
    },
}

impl PaymentEvent {
    pub fn payment_updated(payment: &Payment) -> Self {
        PaymentEvent::PaymentUpdated {
            org_id: payment.org_id.clone(),
            payment_id: payment.id.clone(),
            payment_number: payment.payment_number.clone(),
            invoice_id: payment.invoice_id.clone(),
            method: payment.method,
            status: payment.status,
            amount: payment.amount,
        }
    }

    pub fn invoice_updated(invoice: &Invoice) -> Self {
        PaymentEvent::InvoiceUpdated {
            org_id: invoice.org_id.clone(),
            invoice_id: invoice.id.clone(),
            status: invoice.status,
            paid_amount: invoice.paid_amount,
            balance: invoice.balance(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentUpdated { .. } => "payment.updated",
            PaymentEvent::InvoiceUpdated { .. } => "invoice.updated",
        }
    }

    pub fn org_id(&self) -> &str {
        match self {
            PaymentEvent::PaymentUpdated { org_id, .. } => org_id,
            PaymentEvent::InvoiceUpdated { org_id, .. } => org_id,
        }
    }
}
