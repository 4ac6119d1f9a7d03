use crate::product::ProductStatus;
use thiserror::Error;

/// Core error taxonomy. Every variant is returned synchronously with no
/// state mutated; upstream signal failures never reach this type (the
/// pricing pipeline absorbs them), and a partial settlement is a qualified
/// success on the report, not an error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("`{action}` is not allowed while status is `{status}`")]
    InvalidState {
        action: &'static str,
        status: ProductStatus,
    },
    #[error("payment signature mismatch")]
    SignatureInvalid,
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::InvalidState { .. } => "invalid_state",
            CoreError::SignatureInvalid => "signature_invalid",
        }
    }
}
