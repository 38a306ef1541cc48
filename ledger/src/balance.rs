//! Balance records.

use std::cmp::Ordering;
use std::fmt;

use abanex_common::{AbanexError, Owner, Result, Ticker};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identity of a balance record.
///
/// Ordering is owner kind, then ticker, then user id. Lock acquisition
/// follows this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub owner: Owner,
    pub currency: Ticker,
}

impl BalanceKey {
    /// Create a new balance key.
    pub fn new(owner: Owner, currency: Ticker) -> Self {
        Self { owner, currency }
    }

    /// Key of the treasury record for a currency.
    pub fn treasury(currency: Ticker) -> Self {
        Self::new(Owner::Treasury, currency)
    }
}

impl Ord for BalanceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.owner
            .kind()
            .cmp(&other.owner.kind())
            .then_with(|| self.currency.cmp(&other.currency))
            .then_with(|| self.owner.user_id().cmp(&other.owner.user_id()))
    }
}

impl PartialOrd for BalanceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.currency)
    }
}

/// Amount of one currency held by one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Owning party.
    pub owner: Owner,
    /// Currency ticker.
    pub currency: Ticker,
    /// Current amount. Negative only for the treasury.
    pub amount: Decimal,
    /// Number of committed writes to this record.
    pub version: u64,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// Create a new zero balance.
    pub fn zero(key: BalanceKey) -> Self {
        Self {
            owner: key.owner,
            currency: key.currency,
            amount: Decimal::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Get the record key.
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.owner, self.currency.clone())
    }

    /// Value of this balance at the given dollar price.
    pub fn in_dollars(&self, dollar_value: Decimal) -> Result<Decimal> {
        self.amount.checked_mul(dollar_value).ok_or_else(|| {
            AbanexError::InvalidAmount(format!(
                "{} at {} is out of range",
                self.amount, dollar_value
            ))
        })
    }

    /// Check if the owner can cover a debit of `amount`.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.owner.allows_debt() || self.amount >= amount
    }
}
