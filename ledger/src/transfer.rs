//! Atomic single-currency moves between balance records.

use std::sync::Arc;

use abanex_common::{validate_amount, AbanexError, Owner, Result, Ticker, UnitId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::balance::BalanceKey;
use crate::engine::{BalanceLedger, LedgerTxn};
use crate::journal::EntrySource;

/// A movement of one currency between two owners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Debited owner.
    pub from: Owner,
    /// Credited owner.
    pub to: Owner,
    /// Currency moved.
    pub currency: Ticker,
    /// Amount moved.
    pub amount: Decimal,
}

impl Transfer {
    /// Create a new transfer.
    pub fn new(from: Owner, to: Owner, currency: Ticker, amount: Decimal) -> Self {
        Self {
            from,
            to,
            currency,
            amount,
        }
    }

    /// Key of the debited record.
    pub fn from_key(&self) -> BalanceKey {
        BalanceKey::new(self.from, self.currency.clone())
    }

    /// Key of the credited record.
    pub fn to_key(&self) -> BalanceKey {
        BalanceKey::new(self.to, self.currency.clone())
    }

    /// Check amount and endpoints.
    pub fn validate(&self) -> Result<()> {
        validate_amount(self.amount)?;
        if self.from == self.to {
            return Err(AbanexError::InvalidTransfer(format!(
                "{} cannot transfer {} to itself",
                self.from, self.currency
            )));
        }
        Ok(())
    }
}

/// Executes transfers as all-or-nothing ledger units.
pub struct TransferEngine {
    ledger: Arc<BalanceLedger>,
}

impl TransferEngine {
    /// Create a new transfer engine.
    pub fn new(ledger: Arc<BalanceLedger>) -> Self {
        Self { ledger }
    }

    /// Get the underlying ledger.
    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    /// Move `amount` of `currency` from one owner to another in one unit.
    ///
    /// A user source without enough funds fails with `InsufficientFunds`
    /// and nothing changes.
    #[instrument(skip(self), fields(from = %from, to = %to, currency = %currency))]
    pub async fn move_funds(
        &self,
        from: Owner,
        to: Owner,
        currency: &Ticker,
        amount: Decimal,
    ) -> Result<UnitId> {
        self.execute(&[Transfer::new(from, to, currency.clone(), amount)])
            .await
    }

    /// Execute several transfers as one unit. Either all land or none do.
    pub async fn execute(&self, transfers: &[Transfer]) -> Result<UnitId> {
        let mut txn = self.begin(transfers).await?;
        for transfer in transfers {
            Self::apply(&mut txn, transfer)?;
        }
        let unit_id = txn.id();
        txn.commit().await?;

        info!(unit_id = %unit_id, legs = transfers.len(), "Transfer committed");
        Ok(unit_id)
    }

    /// Open a unit locking every record the transfers touch. Callers may
    /// inspect the locked records, [`apply`](Self::apply) the transfers and
    /// commit.
    pub async fn begin(&self, transfers: &[Transfer]) -> Result<LedgerTxn<'_>> {
        for transfer in transfers {
            transfer.validate()?;
        }
        let keys: Vec<BalanceKey> = transfers
            .iter()
            .flat_map(|t| [t.from_key(), t.to_key()])
            .collect();
        self.ledger.begin(&keys, EntrySource::Transfer).await
    }

    /// Stage one transfer inside an open unit: debit first, then credit.
    pub fn apply(txn: &mut LedgerTxn<'_>, transfer: &Transfer) -> Result<()> {
        transfer.validate()?;
        txn.decrease(&transfer.from_key(), transfer.amount)?;
        txn.increase(&transfer.to_key(), transfer.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_manager::LockConfig;
    use crate::store::{FailPoint, FaultyStore, MemoryStore};
    use abanex_common::UserId;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ticker(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    async fn funded_engine(user: Owner, amount: Decimal) -> TransferEngine {
        let ledger = Arc::new(BalanceLedger::in_memory());
        ledger.increase(user, &ticker("USD"), amount).await.unwrap();
        TransferEngine::new(ledger)
    }

    #[tokio::test]
    async fn test_move_user_to_treasury() {
        let user = Owner::User(UserId::new());
        let engine = funded_engine(user, dec!(100)).await;

        let unit = engine
            .move_funds(user, Owner::Treasury, &ticker("USD"), dec!(40))
            .await
            .unwrap();

        let ledger = engine.ledger();
        assert_eq!(ledger.balance(user, &ticker("USD")).await.unwrap(), dec!(60));
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("USD")).await.unwrap(), dec!(40));
        assert_eq!(ledger.journal().entries_for_unit(unit).len(), 2);
        assert!(ledger.verify_integrity());
    }

    #[tokio::test]
    async fn test_insufficient_funds_changes_nothing() {
        let user = Owner::User(UserId::new());
        let engine = funded_engine(user, dec!(10)).await;

        let err = engine
            .move_funds(user, Owner::Treasury, &ticker("USD"), dec!(11))
            .await
            .unwrap_err();

        assert!(matches!(err, AbanexError::InsufficientFunds { .. }));
        let ledger = engine.ledger();
        assert_eq!(ledger.balance(user, &ticker("USD")).await.unwrap(), dec!(10));
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("USD")).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_treasury_source_may_go_negative() {
        let user = Owner::User(UserId::new());
        let engine = TransferEngine::new(Arc::new(BalanceLedger::in_memory()));

        engine
            .move_funds(Owner::Treasury, user, &ticker("BTC"), dec!(2))
            .await
            .unwrap();

        let ledger = engine.ledger();
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("BTC")).await.unwrap(), dec!(-2));
        assert_eq!(ledger.balance(user, &ticker("BTC")).await.unwrap(), dec!(2));
    }

    #[tokio::test]
    async fn test_invalid_transfers_rejected() {
        let user = Owner::User(UserId::new());
        let engine = funded_engine(user, dec!(10)).await;

        assert!(matches!(
            engine.move_funds(user, user, &ticker("USD"), dec!(1)).await,
            Err(AbanexError::InvalidTransfer(_))
        ));
        assert!(matches!(
            engine.move_funds(user, Owner::Treasury, &ticker("USD"), dec!(0)).await,
            Err(AbanexError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_second_leg_rolls_back_first() {
        let user = Owner::User(UserId::new());
        let engine = funded_engine(user, dec!(100)).await;

        let legs = [
            Transfer::new(user, Owner::Treasury, ticker("USD"), dec!(50)),
            Transfer::new(user, Owner::Treasury, ticker("USD"), dec!(60)),
        ];
        let err = engine.execute(&legs).await.unwrap_err();

        assert!(matches!(err, AbanexError::InsufficientFunds { .. }));
        let ledger = engine.ledger();
        assert_eq!(ledger.balance(user, &ticker("USD")).await.unwrap(), dec!(100));
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("USD")).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_whole_unit() {
        let store = Arc::new(FaultyStore::new(MemoryStore::new()));
        let ledger = Arc::new(BalanceLedger::new(store.clone(), LockConfig::default()));
        let user = Owner::User(UserId::new());
        ledger.increase(user, &ticker("USD"), dec!(100)).await.unwrap();
        let engine = TransferEngine::new(ledger.clone());

        store.inject(FailPoint::Commit);
        let err = engine
            .move_funds(user, Owner::Treasury, &ticker("USD"), dec!(25))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(ledger.balance(user, &ticker("USD")).await.unwrap(), dec!(100));
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("USD")).await.unwrap(), dec!(0));
        assert_eq!(ledger.locks().held_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposing_moves_do_not_deadlock() {
        let alice = Owner::User(UserId::new());
        let bob = Owner::User(UserId::new());
        let ledger = Arc::new(BalanceLedger::in_memory());
        ledger.increase(alice, &ticker("USD"), dec!(1000)).await.unwrap();
        ledger.increase(bob, &ticker("USD"), dec!(1000)).await.unwrap();
        let engine = Arc::new(TransferEngine::new(ledger.clone()));

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let engine = engine.clone();
                let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
                tokio::spawn(async move {
                    engine.move_funds(from, to, &ticker("USD"), dec!(1)).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(ledger.balance(alice, &ticker("USD")).await.unwrap(), dec!(1000));
        assert_eq!(ledger.balance(bob, &ticker("USD")).await.unwrap(), dec!(1000));
    }

    #[derive(Debug, Clone)]
    struct Step {
        from: usize,
        to: usize,
        cents: u32,
    }

    fn step() -> impl Strategy<Value = Step> {
        (0usize..4, 0usize..4, 1u32..50_000).prop_map(|(from, to, cents)| Step { from, to, cents })
    }

    proptest! {
        #[test]
        fn prop_transfers_conserve_supply(steps in proptest::collection::vec(step(), 1..40)) {
            tokio_test::block_on(async {
                let usd = ticker("USD");
                // Index 0 is the treasury, the rest are users.
                let owners = [
                    Owner::Treasury,
                    Owner::User(UserId::new()),
                    Owner::User(UserId::new()),
                    Owner::User(UserId::new()),
                ];
                let ledger = Arc::new(BalanceLedger::in_memory());
                for owner in &owners[1..] {
                    ledger.increase(*owner, &usd, dec!(100)).await.unwrap();
                }
                let engine = TransferEngine::new(ledger.clone());
                let supply = ledger.total_supply(&usd).await.unwrap();

                for step in &steps {
                    let amount = Decimal::new(step.cents as i64, 2);
                    let _ = engine
                        .move_funds(owners[step.from], owners[step.to], &usd, amount)
                        .await;
                }

                assert_eq!(ledger.total_supply(&usd).await.unwrap(), supply);
                for owner in &owners[1..] {
                    assert!(ledger.balance(*owner, &usd).await.unwrap() >= Decimal::ZERO);
                }
                assert!(ledger.verify_integrity());
            });
        }
    }
}
