//! Market error types.

use abanex_common::{AbanexError, Ticker};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the catalog and exchange providers.
#[derive(Debug, Error)]
pub enum MarketError {
    /// Ticker is not registered.
    #[error("Currency not found: {0}")]
    CurrencyNotFound(Ticker),

    /// Ticker is already registered.
    #[error("Currency already registered: {0}")]
    DuplicateTicker(Ticker),

    /// Dollar value rejected by the catalog.
    #[error("Invalid dollar value {value} for {ticker}")]
    InvalidDollarValue { ticker: Ticker, value: Decimal },

    /// Order quantity is not a positive whole number.
    #[error("Invalid order quantity {0}")]
    InvalidQuantity(Decimal),

    /// Order value is below the exchange minimum.
    #[error("Order value {value} is below minimum {minimum}")]
    OrderTooSmall { value: Decimal, minimum: Decimal },

    /// The ledger could not record a fill.
    #[error("Ledger error: {0}")]
    Ledger(#[from] AbanexError),
}

impl From<MarketError> for AbanexError {
    fn from(err: MarketError) -> Self {
        match err {
            MarketError::CurrencyNotFound(ticker) => AbanexError::CurrencyNotFound(ticker.to_string()),
            MarketError::DuplicateTicker(ticker) => AbanexError::DuplicateTicker(ticker),
            MarketError::InvalidDollarValue { ticker, value } => AbanexError::InvalidAmount(format!(
                "dollar value {} for {} must not be negative",
                value, ticker
            )),
            MarketError::InvalidQuantity(quantity) => {
                AbanexError::InvalidAmount(format!("order quantity {}", quantity))
            }
            MarketError::OrderTooSmall { value, minimum } => {
                AbanexError::OrderTooSmall { value, minimum }
            }
            MarketError::Ledger(err) => err,
        }
    }
}

/// Result type for market operations.
pub type MarketResult<T> = Result<T, MarketError>;
