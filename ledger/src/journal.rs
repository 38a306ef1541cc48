//! Journal of committed balance changes.

use std::collections::BTreeMap;

use abanex_common::{Owner, Ticker, UnitId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::balance::BalanceKey;

/// Type of journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Balance decreased.
    Debit,
    /// Balance increased.
    Credit,
}

/// What produced a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySource {
    /// Value-neutral moves between records. Debits equal credits per currency.
    Transfer,
    /// Single-sided change that adds or removes supply (deposits, exchange buys).
    Adjustment,
}

/// A single journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Unit this entry was committed in.
    pub unit_id: UnitId,
    /// What produced the unit.
    pub source: EntrySource,
    /// Owner affected.
    pub owner: Owner,
    /// Currency affected.
    pub currency: Ticker,
    /// Entry type.
    pub entry_type: EntryType,
    /// Amount (always positive).
    pub amount: Decimal,
    /// Balance after this entry.
    pub balance_after: Decimal,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Create a new entry.
    pub fn new(
        unit_id: UnitId,
        source: EntrySource,
        key: &BalanceKey,
        entry_type: EntryType,
        amount: Decimal,
        balance_after: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit_id,
            source,
            owner: key.owner,
            currency: key.currency.clone(),
            entry_type,
            amount,
            balance_after,
            created_at: Utc::now(),
        }
    }

    /// Signed effect on the balance.
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            EntryType::Credit => self.amount,
            EntryType::Debit => -self.amount,
        }
    }
}

/// Append-only list of committed entries.
#[derive(Default)]
pub struct Journal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl Journal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the entries of one committed unit.
    pub fn append(&self, entries: Vec<JournalEntry>) {
        self.entries.write().extend(entries);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries of one unit.
    pub fn entries_for_unit(&self, unit_id: UnitId) -> Vec<JournalEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.unit_id == unit_id)
            .cloned()
            .collect()
    }

    /// Entries touching one record, oldest first.
    pub fn entries_for(&self, key: &BalanceKey) -> Vec<JournalEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.owner == key.owner && e.currency == key.currency)
            .cloned()
            .collect()
    }

    /// Net supply change of a currency from adjustments.
    pub fn net_adjustments(&self, currency: &Ticker) -> Decimal {
        self.entries
            .read()
            .iter()
            .filter(|e| e.source == EntrySource::Adjustment && &e.currency == currency)
            .map(JournalEntry::signed_amount)
            .sum()
    }

    /// Transfer units whose entries do not net to zero in some currency.
    pub fn unbalanced_units(&self) -> Vec<UnitId> {
        let mut nets: BTreeMap<(UnitId, Ticker), Decimal> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            if entry.source != EntrySource::Transfer {
                continue;
            }
            *nets
                .entry((entry.unit_id, entry.currency.clone()))
                .or_insert(Decimal::ZERO) += entry.signed_amount();
        }

        let mut units: Vec<UnitId> = nets
            .into_iter()
            .filter(|(_, net)| !net.is_zero())
            .map(|((unit_id, _), _)| unit_id)
            .collect();
        units.dedup();
        units
    }

    /// Verify every transfer unit is value-neutral.
    pub fn verify_integrity(&self) -> bool {
        self.unbalanced_units().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abanex_common::UserId;
    use rust_decimal_macros::dec;

    fn key(owner: Owner, ticker: &str) -> BalanceKey {
        BalanceKey::new(owner, Ticker::parse(ticker).unwrap())
    }

    #[test]
    fn test_balanced_transfer_unit() {
        let journal = Journal::new();
        let unit = UnitId::new();
        let user = Owner::User(UserId::new());

        journal.append(vec![
            JournalEntry::new(unit, EntrySource::Transfer, &key(user, "USD"), EntryType::Debit, dec!(10), dec!(90)),
            JournalEntry::new(unit, EntrySource::Transfer, &key(Owner::Treasury, "USD"), EntryType::Credit, dec!(10), dec!(10)),
        ]);

        assert_eq!(journal.len(), 2);
        assert!(journal.verify_integrity());
        assert_eq!(journal.entries_for_unit(unit).len(), 2);
        assert_eq!(journal.entries_for(&key(user, "USD"))[0].balance_after, dec!(90));
    }

    #[test]
    fn test_unbalanced_transfer_detected() {
        let journal = Journal::new();
        let unit = UnitId::new();

        journal.append(vec![JournalEntry::new(
            unit,
            EntrySource::Transfer,
            &key(Owner::Treasury, "USD"),
            EntryType::Credit,
            dec!(10),
            dec!(10),
        )]);

        assert_eq!(journal.unbalanced_units(), vec![unit]);
        assert!(!journal.verify_integrity());
    }

    #[test]
    fn test_adjustments_are_not_integrity_violations() {
        let journal = Journal::new();
        let btc = Ticker::parse("BTC").unwrap();

        journal.append(vec![JournalEntry::new(
            UnitId::new(),
            EntrySource::Adjustment,
            &key(Owner::Treasury, "BTC"),
            EntryType::Credit,
            dec!(3),
            dec!(3),
        )]);

        assert!(journal.verify_integrity());
        assert_eq!(journal.net_adjustments(&btc), dec!(3));
    }
}
