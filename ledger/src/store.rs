//! Storage backends for balance records.

use std::collections::HashMap;

use abanex_common::{AbanexError, Owner, Result, Ticker};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::balance::{BalanceKey, BalanceRecord};

/// Durable storage for balance records.
///
/// Callers hold record locks from the [`LockManager`](crate::LockManager)
/// around every read-modify-write; the store only has to make each
/// `commit` batch all-or-nothing.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Load a record, if it exists.
    async fn load(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>>;

    /// Insert `record` unless the key exists. Returns the stored record, so
    /// racing creators converge on the first one.
    async fn insert_if_absent(&self, record: BalanceRecord) -> Result<BalanceRecord>;

    /// Write a batch of records atomically. Each record's version must be
    /// exactly one above the stored version.
    async fn commit(&self, records: &[BalanceRecord]) -> Result<()>;

    /// All records of one currency.
    async fn scan_currency(&self, currency: &Ticker) -> Result<Vec<BalanceRecord>>;

    /// All records of one owner.
    async fn scan_owner(&self, owner: &Owner) -> Result<Vec<BalanceRecord>>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<BalanceKey, BalanceRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn load(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn insert_if_absent(&self, record: BalanceRecord) -> Result<BalanceRecord> {
        let mut records = self.records.write();
        let stored = records.entry(record.key()).or_insert_with(|| {
            debug!(owner = %record.owner, currency = %record.currency, "Balance record created");
            record
        });
        Ok(stored.clone())
    }

    async fn commit(&self, batch: &[BalanceRecord]) -> Result<()> {
        let mut records = self.records.write();

        // Validate the whole batch before touching anything.
        for record in batch {
            let stored_version = records.get(&record.key()).map(|r| r.version).unwrap_or(0);
            if record.version != stored_version + 1 {
                return Err(AbanexError::TransientStorageFailure(format!(
                    "version conflict on {}: stored {}, writing {}",
                    record.key(),
                    stored_version,
                    record.version
                )));
            }
        }

        for record in batch {
            records.insert(record.key(), record.clone());
        }
        Ok(())
    }

    async fn scan_currency(&self, currency: &Ticker) -> Result<Vec<BalanceRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.currency == currency)
            .cloned()
            .collect())
    }

    async fn scan_owner(&self, owner: &Owner) -> Result<Vec<BalanceRecord>> {
        let mut records: Vec<BalanceRecord> = self
            .records
            .read()
            .values()
            .filter(|r| &r.owner == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(records)
    }
}

/// Where an injected fault fires.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    /// Fail the next commit.
    Commit,
    /// Fail the next load of this key.
    Load(BalanceKey),
}

/// Store wrapper that fails on armed fail points. Each fault fires once.
#[cfg(any(test, feature = "test-utils"))]
pub struct FaultyStore<S> {
    inner: S,
    armed: parking_lot::Mutex<Vec<FailPoint>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl<S: BalanceStore> FaultyStore<S> {
    /// Wrap a store.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            armed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Arm a fail point.
    pub fn inject(&self, point: FailPoint) {
        self.armed.lock().push(point);
    }

    /// Disarm all fail points.
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    fn fire(&self, point: &FailPoint) -> Result<()> {
        let mut armed = self.armed.lock();
        if let Some(idx) = armed.iter().position(|p| p == point) {
            armed.remove(idx);
            return Err(AbanexError::TransientStorageFailure(format!(
                "injected fault at {:?}",
                point
            )));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl<S: BalanceStore> BalanceStore for FaultyStore<S> {
    async fn load(&self, key: &BalanceKey) -> Result<Option<BalanceRecord>> {
        self.fire(&FailPoint::Load(key.clone()))?;
        self.inner.load(key).await
    }

    async fn insert_if_absent(&self, record: BalanceRecord) -> Result<BalanceRecord> {
        self.inner.insert_if_absent(record).await
    }

    async fn commit(&self, records: &[BalanceRecord]) -> Result<()> {
        self.fire(&FailPoint::Commit)?;
        self.inner.commit(records).await
    }

    async fn scan_currency(&self, currency: &Ticker) -> Result<Vec<BalanceRecord>> {
        self.inner.scan_currency(currency).await
    }

    async fn scan_owner(&self, owner: &Owner) -> Result<Vec<BalanceRecord>> {
        self.inner.scan_owner(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abanex_common::UserId;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn key(owner: Owner, ticker: &str) -> BalanceKey {
        BalanceKey::new(owner, Ticker::parse(ticker).unwrap())
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = MemoryStore::new();
        let k = key(Owner::Treasury, "BTC");

        let mut first = BalanceRecord::zero(k.clone());
        first.amount = dec!(5);
        store.insert_if_absent(first).await.unwrap();

        let second = store.insert_if_absent(BalanceRecord::zero(k.clone())).await.unwrap();
        assert_eq!(second.amount, dec!(5));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_creators_converge() {
        let store = Arc::new(MemoryStore::new());
        let k = key(Owner::User(UserId::new()), "USD");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move { store.insert_if_absent(BalanceRecord::zero(k)).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = MemoryStore::new();
        let k = key(Owner::Treasury, "USD");
        let mut record = store.insert_if_absent(BalanceRecord::zero(k.clone())).await.unwrap();

        record.version = 2;
        record.amount = dec!(1);
        let err = store.commit(&[record]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.load(&k).await.unwrap().unwrap().amount, dec!(0));
    }

    #[tokio::test]
    async fn test_commit_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let a = key(Owner::Treasury, "USD");
        let b = key(Owner::Treasury, "BTC");
        let mut ra = store.insert_if_absent(BalanceRecord::zero(a.clone())).await.unwrap();
        let mut rb = store.insert_if_absent(BalanceRecord::zero(b.clone())).await.unwrap();

        ra.version = 1;
        ra.amount = dec!(10);
        rb.version = 7;
        rb.amount = dec!(-10);

        assert!(store.commit(&[ra, rb]).await.is_err());
        assert_eq!(store.load(&a).await.unwrap().unwrap().amount, dec!(0));
        assert_eq!(store.load(&b).await.unwrap().unwrap().amount, dec!(0));
    }

    #[tokio::test]
    async fn test_faulty_store_fires_once() {
        let store = FaultyStore::new(MemoryStore::new());
        let k = key(Owner::Treasury, "ETH");
        let mut record = store.insert_if_absent(BalanceRecord::zero(k.clone())).await.unwrap();
        record.version = 1;

        store.inject(FailPoint::Commit);
        assert!(store.commit(&[record.clone()]).await.is_err());
        assert!(store.commit(&[record]).await.is_ok());

        store.inject(FailPoint::Load(k.clone()));
        assert!(store.load(&k).await.is_err());
        assert!(store.load(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scan_owner_sorted_by_currency() {
        let store = MemoryStore::new();
        let user = Owner::User(UserId::new());
        for ticker in ["USD", "BTC", "ETH"] {
            store.insert_if_absent(BalanceRecord::zero(key(user, ticker))).await.unwrap();
        }
        store.insert_if_absent(BalanceRecord::zero(key(Owner::Treasury, "BTC"))).await.unwrap();

        let records = store.scan_owner(&user).await.unwrap();
        let tickers: Vec<&str> = records.iter().map(|r| r.currency.as_str()).collect();
        assert_eq!(tickers, vec!["BTC", "ETH", "USD"]);
        assert_eq!(store.scan_currency(&Ticker::parse("BTC").unwrap()).await.unwrap().len(), 2);
    }
}
