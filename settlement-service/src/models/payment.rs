use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_LATE_CALLBACKS: usize = 20;

/// One attempt to settle (part of) an invoice.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Payment {
    #[serde(rename = "_id")]
    pub id: String,
    /// Human-readable number, `PAY-<year>-<seq>`. Assigned once.
    pub payment_number: String,
    pub org_id: String,
    pub invoice_id: String,
    /// Payer (the invoice's client).
    pub client_id: String,
    pub initiated_by: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(default)]
    pub processor_refs: ProcessorRefs,
    pub payer_phone: Option<String>,
    pub payer_email: Option<String>,
    /// Processor settlement id (M-Pesa receipt number, Paystack transaction id).
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Last callback/query body that moved this payment, kept for audit.
    pub raw_payload: Option<serde_json::Value>,
    /// Distinct outcomes that arrived after the payment was already terminal,
    /// newest last, at most [`MAX_LATE_CALLBACKS`].
    #[serde(default)]
    pub late_callbacks: Vec<serde_json::Value>,
    /// Whether a completed payment has reached its invoice's `paid_amount`.
    /// Documents written before the flag existed were credited inline.
    #[serde(default = "credited_inline")]
    pub invoice_credited: bool,
    pub notes: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub settled_at: Option<DateTime>,
}

impl Payment {
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        payment_number: String,
        org_id: String,
        invoice_id: String,
        client_id: String,
        initiated_by: Option<String>,
        amount: Decimal,
        currency: String,
        method: PaymentMethod,
        payer_phone: Option<String>,
        payer_email: Option<String>,
    ) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new_v4().to_string(),
            payment_number,
            org_id,
            invoice_id,
            client_id,
            initiated_by,
            amount,
            currency,
            method,
            status: PaymentStatus::Pending,
            processor_refs: ProcessorRefs::default(),
            payer_phone,
            payer_email,
            transaction_id: None,
            failure_reason: None,
            raw_payload: None,
            late_callbacks: Vec::new(),
            invoice_credited: false,
            notes: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.processor_refs.correlation_id(self.method)
    }

    /// Completed, but the invoice credit has not been recorded yet.
    pub fn awaits_invoice_credit(&self) -> bool {
        self.status == PaymentStatus::Completed && !self.invoice_credited
    }
}

fn credited_inline() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    MobileMoney,
    CardGateway,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::CardGateway => "card_gateway",
        }
    }

    /// Document path of the indexed correlation field for this method.
    pub fn correlation_field(&self) -> &'static str {
        match self {
            PaymentMethod::MobileMoney => "processor_refs.mobile_money.checkout_request_id",
            PaymentMethod::CardGateway => "processor_refs.card_gateway.reference",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "mobile_money" | "mpesa" => Ok(PaymentMethod::MobileMoney),
            "card_gateway" | "card" | "paystack" => Ok(PaymentMethod::CardGateway),
            other => Err(format!("unsupported payment method '{}'", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processor correlation identifiers, one sub-record per method.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ProcessorRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_money: Option<MobileMoneyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_gateway: Option<CardGatewayRef>,
}

impl ProcessorRefs {
    pub fn correlation_id(&self, method: PaymentMethod) -> Option<&str> {
        match method {
            PaymentMethod::MobileMoney => self
                .mobile_money
                .as_ref()
                .map(|r| r.checkout_request_id.as_str()),
            PaymentMethod::CardGateway => self.card_gateway.as_ref().map(|r| r.reference.as_str()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mobile_money.is_none() && self.card_gateway.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MobileMoneyRef {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CardGatewayRef {
    pub reference: String,
    pub authorization_url: Option<String>,
    pub access_code: Option<String>,
}

/// How a store locates the payment a transition applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentSelector {
    Id(String),
    Correlation {
        method: PaymentMethod,
        correlation_id: String,
    },
}

impl fmt::Display for PaymentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentSelector::Id(id) => write!(f, "id={}", id),
            PaymentSelector::Correlation {
                method,
                correlation_id,
            } => write!(f, "{}={}", method, correlation_id),
        }
    }
}

/// A single move out of `pending`.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
}

impl StatusTransition {
    pub fn completed(transaction_id: Option<String>, raw_payload: serde_json::Value) -> Self {
        Self {
            status: PaymentStatus::Completed,
            transaction_id,
            failure_reason: None,
            raw_payload: Some(raw_payload),
        }
    }

    pub fn failed(reason: impl Into<String>, raw_payload: Option<serde_json::Value>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            transaction_id: None,
            failure_reason: Some(reason.into()),
            raw_payload,
        }
    }
}

/// Result of a conditional `pending -> terminal` write.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// This call moved the payment; the returned document is post-update.
    Applied(Payment),
    /// The payment had already left `pending`; nothing was written.
    AlreadyTerminal(Payment),
    NotFound,
}

pub fn format_payment_number(year: i32, sequence: u64) -> String {
    format!("PAY-{}-{:04}", year, sequence)
}
