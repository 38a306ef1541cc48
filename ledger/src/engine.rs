//! Core ledger engine implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use abanex_common::{validate_amount, AbanexError, Owner, Result, Ticker, UnitId};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument};

use crate::balance::{BalanceKey, BalanceRecord};
use crate::journal::{EntrySource, EntryType, Journal, JournalEntry};
use crate::lock_manager::{LockConfig, LockManager, RecordGuard};
use crate::store::{BalanceStore, MemoryStore};

/// The ledger owns every balance record and is the only writer.
pub struct BalanceLedger {
    store: Arc<dyn BalanceStore>,
    locks: LockManager,
    journal: Journal,
}

impl BalanceLedger {
    /// Create a ledger over a store.
    pub fn new(store: Arc<dyn BalanceStore>, lock_config: LockConfig) -> Self {
        Self {
            store,
            locks: LockManager::new(lock_config),
            journal: Journal::new(),
        }
    }

    /// Create a ledger over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), LockConfig::default())
    }

    /// Get the lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Get the journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Return the record for (owner, currency), creating a zero record if
    /// none exists. Concurrent creators converge on a single record.
    pub async fn get_or_create(&self, owner: Owner, currency: &Ticker) -> Result<BalanceRecord> {
        let key = BalanceKey::new(owner, currency.clone());
        self.load_or_create(&key).await
    }

    /// Current amount, zero if the record does not exist yet. Does not create.
    pub async fn balance(&self, owner: Owner, currency: &Ticker) -> Result<Decimal> {
        let key = BalanceKey::new(owner, currency.clone());
        Ok(self
            .store
            .load(&key)
            .await?
            .map(|r| r.amount)
            .unwrap_or(Decimal::ZERO))
    }

    /// Atomically add `amount` to one record.
    #[instrument(skip(self), fields(owner = %owner, currency = %currency))]
    pub async fn increase(
        &self,
        owner: Owner,
        currency: &Ticker,
        amount: Decimal,
    ) -> Result<BalanceRecord> {
        let key = BalanceKey::new(owner, currency.clone());
        let mut txn = self.begin(&[key.clone()], EntrySource::Adjustment).await?;
        txn.increase(&key, amount)?;
        let mut written = txn.commit().await?;
        Ok(written.remove(0))
    }

    /// Atomically subtract `amount` from one record. Fails with
    /// `InsufficientFunds` if a user balance would go negative.
    #[instrument(skip(self), fields(owner = %owner, currency = %currency))]
    pub async fn decrease(
        &self,
        owner: Owner,
        currency: &Ticker,
        amount: Decimal,
    ) -> Result<BalanceRecord> {
        let key = BalanceKey::new(owner, currency.clone());
        let mut txn = self.begin(&[key.clone()], EntrySource::Adjustment).await?;
        txn.decrease(&key, amount)?;
        let mut written = txn.commit().await?;
        Ok(written.remove(0))
    }

    /// Open an atomic unit over `keys`, waiting up to the configured lock
    /// timeout.
    pub async fn begin(&self, keys: &[BalanceKey], source: EntrySource) -> Result<LedgerTxn<'_>> {
        self.begin_within(keys, source, self.locks.config().acquire_timeout)
            .await
    }

    /// Open an atomic unit over `keys`, waiting up to `timeout` for locks.
    ///
    /// Records are locked in global key order and created if missing. The
    /// unit writes nothing until [`LedgerTxn::commit`]; dropping it aborts.
    pub async fn begin_within(
        &self,
        keys: &[BalanceKey],
        source: EntrySource,
        timeout: Duration,
    ) -> Result<LedgerTxn<'_>> {
        let guard = self.locks.acquire_within(keys, timeout).await?;

        let mut records = BTreeMap::new();
        for key in guard.keys() {
            let record = self.load_or_create(key).await?;
            records.insert(key.clone(), record);
        }

        let id = UnitId::new();
        debug!(unit_id = %id, records = records.len(), "Ledger unit opened");

        Ok(LedgerTxn {
            ledger: self,
            id,
            source,
            records,
            dirty: BTreeSet::new(),
            entries: Vec::new(),
            _guard: guard,
        })
    }

    /// Sum of every record of a currency, treasury included.
    pub async fn total_supply(&self, currency: &Ticker) -> Result<Decimal> {
        Ok(self
            .store
            .scan_currency(currency)
            .await?
            .iter()
            .map(|r| r.amount)
            .sum())
    }

    /// Every record of one owner, ordered by ticker.
    pub async fn balances_of(&self, owner: Owner) -> Result<Vec<BalanceRecord>> {
        self.store.scan_owner(&owner).await
    }

    /// Verify every committed transfer unit is value-neutral.
    pub fn verify_integrity(&self) -> bool {
        self.journal.verify_integrity()
    }

    async fn load_or_create(&self, key: &BalanceKey) -> Result<BalanceRecord> {
        if let Some(record) = self.store.load(key).await? {
            return Ok(record);
        }
        self.store
            .insert_if_absent(BalanceRecord::zero(key.clone()))
            .await
    }
}

impl Default for BalanceLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// An open atomic unit over a locked set of records.
///
/// Changes are staged in memory and written by a single store commit.
/// Dropping the unit without committing leaves every record untouched.
pub struct LedgerTxn<'a> {
    ledger: &'a BalanceLedger,
    id: UnitId,
    source: EntrySource,
    records: BTreeMap<BalanceKey, BalanceRecord>,
    dirty: BTreeSet<BalanceKey>,
    entries: Vec<JournalEntry>,
    _guard: RecordGuard,
}

impl<'a> LedgerTxn<'a> {
    /// Unit identifier.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Staged view of a record in this unit.
    pub fn record(&self, key: &BalanceKey) -> Result<&BalanceRecord> {
        self.records.get(key).ok_or_else(|| {
            AbanexError::InvalidTransfer(format!("record {} is not part of unit {}", key, self.id))
        })
    }

    /// Staged amount of a record in this unit.
    pub fn amount(&self, key: &BalanceKey) -> Result<Decimal> {
        Ok(self.record(key)?.amount)
    }

    /// Stage an increase.
    pub fn increase(&mut self, key: &BalanceKey, amount: Decimal) -> Result<()> {
        let amount = validate_amount(amount)?;
        let record = self.record_mut(key)?;
        record.amount = record.amount.checked_add(amount).ok_or_else(|| {
            AbanexError::InvalidAmount(format!("credit of {} overflows {}", amount, key))
        })?;
        let balance_after = record.amount;
        self.stage(key, EntryType::Credit, amount, balance_after);
        Ok(())
    }

    /// Stage a decrease. User records may not go negative; on failure
    /// nothing is staged.
    pub fn decrease(&mut self, key: &BalanceKey, amount: Decimal) -> Result<()> {
        let amount = validate_amount(amount)?;
        let record = self.record_mut(key)?;
        if !record.has_sufficient_funds(amount) {
            return Err(AbanexError::InsufficientFunds {
                required: amount,
                available: record.amount,
            });
        }
        record.amount = record.amount.checked_sub(amount).ok_or_else(|| {
            AbanexError::InvalidAmount(format!("debit of {} overflows {}", amount, key))
        })?;
        let balance_after = record.amount;
        self.stage(key, EntryType::Debit, amount, balance_after);
        Ok(())
    }

    /// Write every staged change in one store commit and release the locks.
    ///
    /// Returns the written records in key order.
    pub async fn commit(self) -> Result<Vec<BalanceRecord>> {
        let now = Utc::now();
        let written: Vec<BalanceRecord> = self
            .dirty
            .iter()
            .filter_map(|key| self.records.get(key))
            .map(|record| {
                let mut record = record.clone();
                record.version += 1;
                record.updated_at = now;
                record
            })
            .collect();

        if written.is_empty() {
            return Ok(written);
        }

        if let Err(e) = self.ledger.store.commit(&written).await {
            error!(unit_id = %self.id, error = %e, "Ledger unit commit failed");
            return Err(e);
        }

        info!(
            unit_id = %self.id,
            source = ?self.source,
            records = written.len(),
            "Ledger unit committed"
        );

        self.ledger.journal.append(self.entries);
        Ok(written)
    }

    fn record_mut(&mut self, key: &BalanceKey) -> Result<&mut BalanceRecord> {
        let id = self.id;
        self.records.get_mut(key).ok_or_else(|| {
            AbanexError::InvalidTransfer(format!("record {} is not part of unit {}", key, id))
        })
    }

    fn stage(&mut self, key: &BalanceKey, entry_type: EntryType, amount: Decimal, balance_after: Decimal) {
        self.dirty.insert(key.clone());
        self.entries.push(JournalEntry::new(
            self.id,
            self.source,
            key,
            entry_type,
            amount,
            balance_after,
        ));
    }
}
