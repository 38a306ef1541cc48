//! Record-level lock management for ledger units.

use std::sync::Arc;
use std::time::Duration;

use abanex_common::{AbanexError, Result};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::balance::BalanceKey;

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum time to wait for all records of a unit.
    pub acquire_timeout: Duration,
    /// Idle lock pruning interval.
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Exclusive hold over a set of balance records.
///
/// Dropping the guard releases every record together.
pub struct RecordGuard {
    keys: Vec<BalanceKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl RecordGuard {
    /// Keys held, in acquisition order.
    pub fn keys(&self) -> &[BalanceKey] {
        &self.keys
    }

    /// Check if a key is held by this guard.
    pub fn holds(&self, key: &BalanceKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

/// Manager for per-record locks.
pub struct LockManager {
    /// One mutex per record that has ever been locked (until pruned).
    records: DashMap<BalanceKey, Arc<Mutex<()>>>,
    /// Configuration.
    config: LockConfig,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire every key, in global key order, within the configured timeout.
    pub async fn acquire(&self, keys: &[BalanceKey]) -> Result<RecordGuard> {
        self.acquire_within(keys, self.config.acquire_timeout).await
    }

    /// Acquire every key, in global key order, within `timeout`.
    ///
    /// On timeout the records acquired so far are released and nothing is
    /// held.
    pub async fn acquire_within(
        &self,
        keys: &[BalanceKey],
        timeout: Duration,
    ) -> Result<RecordGuard> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            let mutex = self.records.entry(key.clone()).or_default().clone();
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    warn!(record = %key, held = guards.len(), "Record lock timeout");
                    return Err(AbanexError::Timeout(format!("lock acquisition on {}", key)));
                }
            }
        }

        debug!(records = keys.len(), "Records locked");

        Ok(RecordGuard {
            keys,
            _guards: guards,
        })
    }

    /// Number of records currently locked.
    pub fn held_count(&self) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.value().try_lock().is_err())
            .count()
    }

    /// Number of tracked records.
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Drop mutexes nobody holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.records.len()
    }

    /// Run cleanup loop to prune idle record locks.
    pub async fn run_cleanup_loop(&self) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            let pruned = self.prune_idle();
            if pruned > 0 {
                debug!(pruned, "Pruned idle record locks");
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}
