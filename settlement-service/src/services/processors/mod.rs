//! Payment processor adapters.
//!
//! Each adapter hides one provider's wire protocol behind [`PaymentProcessor`]:
//! a charge request goes out, correlation ids come back, and inbound webhook
//! or status-query payloads are normalised into a [`ProcessorOutcome`].

pub mod http;
pub mod mpesa;
pub mod paystack;

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::http::Transient;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{PaymentMethod, ProcessorRefs};

pub use mpesa::MpesaClient;
pub use paystack::PaystackClient;

/// Generic "charge this amount" request.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount: Decimal,
    /// Normalised MSISDN for mobile money, email for card.
    pub payer_identifier: String,
    /// Shown to the payer by the processor (invoice number).
    pub invoice_reference: String,
    pub payment_id: String,
    pub payment_number: String,
    pub callback_url: String,
}

#[derive(Debug, Clone)]
pub struct ChargeResponse {
    pub refs: ProcessorRefs,
    /// The id a later webhook or poll will carry.
    pub correlation_id: String,
    /// Hosted payment page, for redirect-based processors.
    pub redirect_url: Option<String>,
    pub raw: serde_json::Value,
}

/// Normalised outcome reported by a processor for one charge.
#[derive(Debug, Clone)]
pub struct ProcessorOutcome {
    pub correlation_id: String,
    pub success: bool,
    pub amount: Option<Decimal>,
    pub payer_identifier: Option<String>,
    pub transaction_id: Option<String>,
    pub description: Option<String>,
    pub raw: serde_json::Value,
}

/// Result of parsing an inbound webhook body. Parsing never fails loudly.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// A terminal outcome for a charge.
    Resolved(ProcessorOutcome),
    /// Well-formed, but not something settlement acts on (e.g. unrelated event).
    Ignored(String),
    /// Structurally invalid or missing the correlation id.
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Succeeded,
    Failed,
    Processing,
}

/// Answer to an active status poll.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: RemoteState,
    pub result_code: String,
    pub result_desc: String,
    pub transaction_id: Option<String>,
    pub amount: Option<Decimal>,
    pub raw: serde_json::Value,
}

impl StatusReport {
    /// The poll result as an outcome, or `None` while the charge is in flight.
    pub fn into_outcome(self, correlation_id: &str) -> Option<ProcessorOutcome> {
        let success = match self.state {
            RemoteState::Succeeded => true,
            RemoteState::Failed => false,
            RemoteState::Processing => return None,
        };
        Some(ProcessorOutcome {
            correlation_id: correlation_id.to_string(),
            success,
            amount: self.amount,
            payer_identifier: None,
            transaction_id: self.transaction_id,
            description: Some(self.result_desc),
            raw: self.raw,
        })
    }
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{processor} is not configured")]
    NotConfigured { processor: &'static str },

    #[error("{processor} request failed: {message}")]
    Network {
        processor: &'static str,
        message: String,
        timeout: bool,
    },

    #[error("{processor} returned HTTP {status}: {body}")]
    Http {
        processor: &'static str,
        status: u16,
        body: String,
    },

    #[error("{processor} rejected the request: {message}")]
    Rejected {
        processor: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("{processor} sent an unexpected response: {message}")]
    InvalidResponse {
        processor: &'static str,
        message: String,
    },
}

impl ProcessorError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProcessorError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Transient for ProcessorError {
    fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Network { .. } => true,
            ProcessorError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn method(&self) -> PaymentMethod;

    fn is_configured(&self) -> bool;

    /// Initiate a charge. Returns once the processor has accepted it.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ProcessorError>;

    /// Parse an inbound webhook body. Pure and infallible.
    fn parse_callback(&self, body: &[u8]) -> CallbackOutcome;

    /// Actively ask the processor where a charge stands.
    async fn query_status(&self, correlation_id: &str) -> Result<StatusReport, ProcessorError>;
}

/// Adapters keyed by the payment method they serve.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<PaymentMethod, Arc<dyn PaymentProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processors.insert(processor.method(), processor);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<&Arc<dyn PaymentProcessor>> {
        self.processors.get(&method)
    }
}
