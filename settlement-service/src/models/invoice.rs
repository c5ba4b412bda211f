use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The slice of an invoice this service reads and mutates.
///
/// Invoices are owned by the invoicing module; settlement only ever touches
/// `paid_amount`, `status`, `credited_payments`, `version` and `updated_at`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    pub invoice_number: String,
    pub client_id: String,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub currency: String,
    pub total_amount: Decimal,
    #[serde(default)]
    pub paid_amount: Decimal,
    pub status: InvoiceStatus,
    /// Ids of the payments already counted in `paid_amount`.
    #[serde(default)]
    pub credited_payments: Vec<String>,
    /// Optimistic concurrency counter, bumped on every ledger write.
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Invoice {
    /// Remaining amount owed. Negative when overpaid.
    pub fn balance(&self) -> Decimal {
        self.total_amount - self.paid_amount
    }

    pub fn is_fully_paid(&self) -> bool {
        self.status == InvoiceStatus::Paid || self.balance() <= Decimal::ZERO
    }

    pub fn has_credited(&self, payment_id: &str) -> bool {
        self.credited_payments.iter().any(|id| id == payment_id)
    }

    /// Credit a completed payment and reclassify.
    ///
    /// Returns `false` and changes nothing if the payment was already credited.
    pub fn record_payment(&mut self, payment_id: &str, amount: Decimal) -> bool {
        if self.has_credited(payment_id) {
            return false;
        }
        self.credited_payments.push(payment_id.to_string());
        self.paid_amount += amount;
        self.status = if self.balance() <= Decimal::ZERO {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::PartiallyPaid
        };
        self.version += 1;
        self.updated_at = DateTime::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn invoice(total: Decimal) -> Invoice {
        let now = DateTime::now();
        Invoice {
            id: "inv-1".to_string(),
            org_id: "org-1".to_string(),
            invoice_number: "INV-2026-0001".to_string(),
            client_id: "client-1".to_string(),
            client_email: None,
            client_phone: None,
            currency: "KES".to_string(),
            total_amount: total,
            paid_amount: Decimal::ZERO,
            status: InvoiceStatus::Sent,
            credited_payments: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn partial_then_full_payment() {
        let mut invoice = invoice(dec!(100));

        assert!(invoice.record_payment("pay-1", dec!(40)));
        assert_eq!(invoice.paid_amount, dec!(40));
        assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(invoice.balance(), dec!(60));

        assert!(invoice.record_payment("pay-2", dec!(60)));
        assert_eq!(invoice.paid_amount, dec!(100));
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.version, 2);
    }

    #[test]
    fn overpayment_is_classified_paid() {
        let mut invoice = invoice(dec!(100));
        invoice.record_payment("pay-1", dec!(120.50));

        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.balance(), dec!(-20.50));
        assert!(invoice.is_fully_paid());
    }

    #[test]
    fn same_payment_is_credited_once() {
        let mut invoice = invoice(dec!(100));
        assert!(invoice.record_payment("pay-1", dec!(30)));
        assert!(!invoice.record_payment("pay-1", dec!(30)));
        assert!(invoice.record_payment("pay-2", dec!(30)));

        assert_eq!(invoice.paid_amount, dec!(60));
        assert_eq!(invoice.version, 2);
        assert!(invoice.has_credited("pay-1"));
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(InvoiceStatus::PartiallyPaid).unwrap(),
            serde_json::json!("partially_paid")
        );
    }
}
