//! Monetary types for Abanex.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AbanexError, Result};

/// Fractional digits carried by every stored amount.
pub const AMOUNT_SCALE: u32 = 4;

/// Maximum ticker length.
pub const MAX_TICKER_LEN: usize = 8;

/// Ticker symbol of a currency. Case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    /// Parse and validate a ticker symbol.
    pub fn parse(symbol: impl Into<String>) -> Result<Self> {
        let symbol = symbol.into();
        if symbol.is_empty()
            || symbol.len() > MAX_TICKER_LEN
            || !symbol.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(AbanexError::InvalidTicker(symbol));
        }
        Ok(Self(symbol))
    }

    /// Get the symbol as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ticker {
    type Err = AbanexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Ticker {
    type Error = AbanexError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Ticker> for String {
    fn from(ticker: Ticker) -> Self {
        ticker.0
    }
}

/// A tradable currency and its reference (dollar) value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    /// Unique ticker symbol.
    pub ticker: Ticker,
    /// Human readable name.
    pub display_name: String,
    /// Value of one unit in dollars.
    pub dollar_value: Decimal,
}

impl Currency {
    /// Create a new currency.
    pub fn new(ticker: Ticker, display_name: impl Into<String>, dollar_value: Decimal) -> Self {
        Self {
            ticker,
            display_name: display_name.into(),
            dollar_value,
        }
    }

    /// Dollar value of `amount` units of this currency.
    ///
    /// Fails with `InvalidAmount` when the product does not fit a `Decimal`.
    pub fn in_dollars(&self, amount: Decimal) -> Result<Decimal> {
        amount
            .checked_mul(self.dollar_value)
            .ok_or_else(|| out_of_range(amount, "*", self.dollar_value))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ticker)
    }
}

/// Check that an amount is strictly positive and fits the stored precision.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(AbanexError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(AbanexError::InvalidAmount(format!(
            "amount {} has more than {} fractional digits",
            amount, AMOUNT_SCALE
        )));
    }
    Ok(amount)
}

/// Divide `value` by `divisor`, failing with `InvalidAmount` instead of
/// overflowing or dividing by zero.
pub fn checked_quotient(value: Decimal, divisor: Decimal) -> Result<Decimal> {
    value
        .checked_div(divisor)
        .ok_or_else(|| out_of_range(value, "/", divisor))
}

fn out_of_range(lhs: Decimal, op: &str, rhs: Decimal) -> AbanexError {
    AbanexError::InvalidAmount(format!("{} {} {} is out of range", lhs, op, rhs))
}

/// Round up to the stored precision. Used for amounts charged to users.
pub fn round_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::AwayFromZero)
}
