//! Error types for Abanex.

use crate::Ticker;
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for Abanex operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbanexError {
    /// Ticker is not registered.
    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    /// A user cannot cover the requested debit.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Exchange order value is below the provider's floor.
    #[error("Order too small: value {value} is below minimum {minimum}")]
    OrderTooSmall { value: Decimal, minimum: Decimal },

    /// The atomic unit could not commit. Nothing was written.
    #[error("Transient storage failure: {0}")]
    TransientStorageFailure(String),

    /// The atomic unit did not complete in time. Nothing was written.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Missing or invalid startup configuration.
    #[error("Misconfigured system: {0}")]
    MisconfiguredSystem(String),

    /// Amount is not positive or exceeds the stored precision.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed ticker symbol.
    #[error("Invalid ticker: {0:?}")]
    InvalidTicker(String),

    /// Ticker already registered.
    #[error("Duplicate ticker: {0}")]
    DuplicateTicker(Ticker),

    /// Transfer endpoints are not valid for a move.
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
}

/// Coarse outcome category surfaced to callers of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    NotFound,
    Forbidden,
    BadRequest,
    ServerError,
}

impl AbanexError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AbanexError::TransientStorageFailure(_) | AbanexError::Timeout(_)
        )
    }

    /// Get error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            AbanexError::CurrencyNotFound(_) => "CURRENCY_NOT_FOUND",
            AbanexError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            AbanexError::OrderTooSmall { .. } => "ORDER_TOO_SMALL",
            AbanexError::TransientStorageFailure(_) => "TRANSIENT_STORAGE_FAILURE",
            AbanexError::Timeout(_) => "TIMEOUT",
            AbanexError::MisconfiguredSystem(_) => "MISCONFIGURED_SYSTEM",
            AbanexError::InvalidAmount(_) => "INVALID_AMOUNT",
            AbanexError::InvalidTicker(_) => "INVALID_TICKER",
            AbanexError::DuplicateTicker(_) => "DUPLICATE_TICKER",
            AbanexError::InvalidTransfer(_) => "INVALID_TRANSFER",
        }
    }

    /// Map onto the status category shown to the purchasing user.
    pub fn status(&self) -> StatusCategory {
        match self {
            AbanexError::CurrencyNotFound(_) => StatusCategory::NotFound,
            AbanexError::InsufficientFunds { .. } => StatusCategory::Forbidden,
            AbanexError::InvalidAmount(_) | AbanexError::InvalidTicker(_) => {
                StatusCategory::BadRequest
            }
            _ => StatusCategory::ServerError,
        }
    }

    /// HTTP status code for the API layer.
    pub fn http_status(&self) -> u16 {
        match self.status() {
            StatusCategory::NotFound => 404,
            StatusCategory::Forbidden => 403,
            StatusCategory::BadRequest => 400,
            StatusCategory::ServerError => 500,
        }
    }

    /// User-facing message. Server-side details are not exposed.
    pub fn public_message(&self) -> &'static str {
        match self.status() {
            StatusCategory::NotFound => "Currency not found.",
            StatusCategory::Forbidden => "Insufficient Funds!",
            StatusCategory::BadRequest => "Invalid request.",
            StatusCategory::ServerError => "An error occurred.",
        }
    }
}

/// Result type alias for Abanex operations.
pub type Result<T> = std::result::Result<T, AbanexError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_mapping() {
        let not_found = AbanexError::CurrencyNotFound("XYZ".to_string());
        assert_eq!(not_found.status(), StatusCategory::NotFound);
        assert_eq!(not_found.http_status(), 404);

        let funds = AbanexError::InsufficientFunds {
            required: dec!(10),
            available: dec!(5),
        };
        assert_eq!(funds.http_status(), 403);
        assert_eq!(funds.public_message(), "Insufficient Funds!");

        let storage = AbanexError::TransientStorageFailure("disk".to_string());
        assert_eq!(storage.http_status(), 500);
        assert_eq!(storage.public_message(), "An error occurred.");
    }

    #[test]
    fn test_retryable() {
        assert!(AbanexError::TransientStorageFailure("x".into()).is_retryable());
        assert!(AbanexError::Timeout("x".into()).is_retryable());
        assert!(!AbanexError::CurrencyNotFound("x".into()).is_retryable());
        assert!(!AbanexError::MisconfiguredSystem("x".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AbanexError::OrderTooSmall {
            value: dec!(9),
            minimum: dec!(10),
        };
        assert_eq!(err.to_string(), "Order too small: value 9 is below minimum 10");
        assert_eq!(err.error_code(), "ORDER_TOO_SMALL");
    }
}
