use service_core::error::AppError;
use thiserror::Error;

use super::processors::ProcessorError;
use crate::models::PaymentMethod;

/// Failures of the settlement workflow, mapped to HTTP by [`AppError`].
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),

    #[error("Invoice {0} not found")]
    InvoiceNotFound(String),

    #[error("Payment {0} not found")]
    PaymentNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} payments are not configured")]
    ProcessorNotConfigured(PaymentMethod),

    #[error(transparent)]
    Gateway(#[from] ProcessorError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            PaymentError::InvoiceNotFound(_) | PaymentError::PaymentNotFound(_) => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            PaymentError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            PaymentError::ProcessorNotConfigured(_) => AppError::ServiceUnavailable(err.to_string()),
            PaymentError::Gateway(ProcessorError::NotConfigured { processor }) => {
                AppError::ServiceUnavailable(format!("{} is not configured", processor))
            }
            PaymentError::Gateway(e) => AppError::BadGateway(e.to_string()),
            PaymentError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}
