//! Abanex Ledger
//!
//! Durable balances keyed by (owner, currency) with atomic multi-record
//! units. Every mutation goes through a [`LedgerTxn`], which holds
//! record-level locks acquired in a fixed global order and writes all of its
//! records in one store commit.

pub mod balance;
pub mod engine;
pub mod journal;
pub mod lock_manager;
pub mod store;
pub mod transfer;

pub use balance::{BalanceKey, BalanceRecord};
pub use engine::{BalanceLedger, LedgerTxn};
pub use journal::{EntrySource, EntryType, Journal, JournalEntry};
pub use lock_manager::{LockConfig, LockManager, RecordGuard};
pub use store::{BalanceStore, MemoryStore};
pub use transfer::{Transfer, TransferEngine};

#[cfg(any(test, feature = "test-utils"))]
pub use store::{FailPoint, FaultyStore};
