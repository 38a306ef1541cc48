//! Purchase orchestration.
//!
//! A purchase converts a user's base currency into a target currency through
//! the treasury:
//!
//! 1. **Priced**: both currencies resolved, cost computed, affordability
//!    pre-checked without locks.
//! 2. **Settled**: base moves user to treasury and target moves treasury to
//!    user in one ledger unit. Affordability is re-checked under the locks.
//! 3. **ReplenishChecked**: the target currency's treasury debt is checked,
//!    inline or through the worker queue. Failures here never undo step 2.

use std::sync::Arc;

use abanex_common::{
    checked_quotient, round_up, validate_amount, AbanexError, Currency, Owner, PurchaseId, Result,
    Ticker, UnitId, UserId,
};
use abanex_ledger::{BalanceLedger, Transfer, TransferEngine};
use abanex_market::{CurrencyCatalog, ExchangeProvider};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ReplenishMode, TreasuryConfig};
use crate::metrics::Metrics;
use crate::replenisher::TreasuryReplenisher;
use crate::worker::{ReplenishmentQueue, ReplenishmentWorker};

/// Purchase lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchasePhase {
    /// Currencies resolved and cost computed.
    Priced,
    /// Both legs committed.
    Settled,
    /// Replenishment check run or queued.
    ReplenishChecked,
}

impl PurchasePhase {
    /// Get valid next phase.
    pub fn valid_transitions(&self) -> &'static [PurchasePhase] {
        match self {
            PurchasePhase::Priced => &[PurchasePhase::Settled],
            PurchasePhase::Settled => &[PurchasePhase::ReplenishChecked],
            PurchasePhase::ReplenishChecked => &[],
        }
    }

    /// Check if transition to the given phase is valid.
    pub fn can_transition_to(&self, next: PurchasePhase) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Purchase request as received from the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Ticker to buy.
    pub currency_ticker: String,
    /// Units to buy.
    pub amount: Decimal,
}

impl PurchaseRequest {
    /// Validate the request fields.
    pub fn parse(&self) -> Result<(Ticker, Decimal)> {
        let ticker = Ticker::parse(self.currency_ticker.clone())?;
        let amount = validate_amount(self.amount)?;
        Ok((ticker, amount))
    }
}

/// Response body for the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseResponse {
    /// Outcome message.
    pub message: String,
}

impl PurchaseResponse {
    /// Response for a committed purchase.
    pub fn success() -> Self {
        Self {
            message: "Purchase successful.".to_string(),
        }
    }

    /// Response for a failed purchase.
    pub fn from_error(error: &AbanexError) -> Self {
        Self {
            message: error.public_message().to_string(),
        }
    }
}

/// Priced conversion, before settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    /// Currency bought.
    pub target: Currency,
    /// Currency paid with.
    pub base: Currency,
    /// Units of target bought.
    pub amount: Decimal,
    /// Cost in dollars.
    pub required_funds: Decimal,
    /// Cost in base units, rounded up to the stored precision.
    pub base_amount: Decimal,
}

/// Record of a committed purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Purchase ID.
    pub id: PurchaseId,
    /// Buyer.
    pub user: UserId,
    /// Currency bought.
    pub currency: Ticker,
    /// Units bought.
    pub amount: Decimal,
    /// Currency paid with.
    pub base_currency: Ticker,
    /// Units of base currency paid.
    pub base_amount: Decimal,
    /// Ledger unit that settled the purchase.
    pub unit_id: UnitId,
    /// Last phase reached.
    pub phase: PurchasePhase,
    /// Settlement time.
    pub timestamp: DateTime<Utc>,
}

impl PurchaseReceipt {
    fn advance(&mut self, next: PurchasePhase) {
        debug_assert!(self.phase.can_transition_to(next));
        debug!(purchase_id = %self.id, from = ?self.phase, to = ?next, "Purchase phase");
        self.phase = next;
    }
}

enum Replenishment {
    Inline(Arc<dyn ExchangeProvider>),
    Queued(ReplenishmentQueue),
}

/// Runs purchases end to end.
pub struct PurchaseOrchestrator {
    config: TreasuryConfig,
    catalog: Arc<CurrencyCatalog>,
    transfers: TransferEngine,
    replenisher: Arc<TreasuryReplenisher>,
    replenishment: Replenishment,
    worker: Mutex<Option<ReplenishmentWorker>>,
    lock_cleanup: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl PurchaseOrchestrator {
    /// Create a new orchestrator.
    ///
    /// Fails with `MisconfiguredSystem` if the configuration is invalid, the
    /// base currency is not in the catalog, or queued replenishment is
    /// requested outside a Tokio runtime.
    pub fn new(
        config: TreasuryConfig,
        catalog: Arc<CurrencyCatalog>,
        ledger: Arc<BalanceLedger>,
        provider: Arc<dyn ExchangeProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let base = catalog.require(&config.base_currency)?;
        if base.dollar_value <= Decimal::ZERO {
            return Err(AbanexError::MisconfiguredSystem(format!(
                "base currency {} has no dollar value",
                base.ticker
            )));
        }

        let metrics = Arc::new(Metrics::new());
        let replenisher = Arc::new(TreasuryReplenisher::new(
            catalog.clone(),
            ledger.clone(),
            config.replenish.debt_threshold,
            metrics.clone(),
        ));

        let (replenishment, worker) = match config.replenish.mode {
            ReplenishMode::Inline => (Replenishment::Inline(provider), None),
            ReplenishMode::Queued => {
                tokio::runtime::Handle::try_current().map_err(|_| {
                    AbanexError::MisconfiguredSystem(
                        "queued replenishment requires a Tokio runtime".to_string(),
                    )
                })?;
                let worker = ReplenishmentWorker::spawn(
                    replenisher.clone(),
                    provider,
                    config.replenish.queue_capacity,
                );
                (Replenishment::Queued(worker.queue()), Some(worker))
            }
        };

        let lock_cleanup = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let ledger = ledger.clone();
                Some(runtime.spawn(async move { ledger.locks().run_cleanup_loop().await }))
            }
            Err(_) => {
                warn!("No Tokio runtime, idle record locks will not be pruned");
                None
            }
        };

        info!(
            base_currency = %config.base_currency,
            threshold = %config.replenish.debt_threshold,
            mode = ?config.replenish.mode,
            "Purchase orchestrator ready"
        );

        Ok(Self {
            config,
            catalog,
            transfers: TransferEngine::new(ledger),
            replenisher,
            replenishment,
            worker: Mutex::new(worker),
            lock_cleanup: Mutex::new(lock_cleanup),
            metrics,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &TreasuryConfig {
        &self.config
    }

    /// Get the ledger.
    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        self.transfers.ledger()
    }

    /// Get the catalog.
    pub fn catalog(&self) -> &Arc<CurrencyCatalog> {
        &self.catalog
    }

    /// Get the replenisher.
    pub fn replenisher(&self) -> &Arc<TreasuryReplenisher> {
        &self.replenisher
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Price `amount` units of `target` in the base currency.
    pub fn quote(&self, target: &Ticker, amount: Decimal) -> Result<Quote> {
        let target = self.catalog.lookup(target)?;
        let base = self.catalog.lookup(&self.config.base_currency)?;
        if base.dollar_value <= Decimal::ZERO {
            return Err(AbanexError::MisconfiguredSystem(format!(
                "base currency {} has no dollar value",
                base.ticker
            )));
        }

        let required_funds = target.in_dollars(amount)?;
        let base_amount = round_up(checked_quotient(required_funds, base.dollar_value)?);

        Ok(Quote {
            target,
            base,
            amount,
            required_funds,
            base_amount,
        })
    }

    /// Run a request from the API layer.
    pub async fn execute_request(
        &self,
        user: UserId,
        request: &PurchaseRequest,
    ) -> Result<PurchaseReceipt> {
        match request.parse() {
            Ok((ticker, amount)) => self.execute(user, &ticker, amount).await,
            Err(e) => {
                self.metrics.purchase_started();
                self.metrics.purchase_failed(&e);
                Err(e)
            }
        }
    }

    /// Buy `amount` units of `target` for `user` with the base currency.
    #[instrument(skip(self), fields(user = %user, currency = %target))]
    pub async fn execute(
        &self,
        user: UserId,
        target: &Ticker,
        amount: Decimal,
    ) -> Result<PurchaseReceipt> {
        self.metrics.purchase_started();

        let result = self.run(user, target, amount).await;
        match &result {
            Ok(receipt) => {
                self.metrics.purchase_succeeded();
                info!(
                    purchase_id = %receipt.id,
                    amount = %receipt.amount,
                    base_amount = %receipt.base_amount,
                    "Purchase completed"
                );
            }
            Err(e) => {
                self.metrics.purchase_failed(e);
                warn!(error = %e, code = e.error_code(), "Purchase failed");
            }
        }
        result
    }

    async fn run(&self, user: UserId, target: &Ticker, amount: Decimal) -> Result<PurchaseReceipt> {
        validate_amount(amount)?;
        let quote = self.quote(target, amount)?;

        // Cheap early rejection; the authoritative check runs under the locks.
        let available = self
            .ledger()
            .balance(Owner::User(user), &quote.base.ticker)
            .await?;
        if quote.required_funds > quote.base.in_dollars(available)? {
            return Err(AbanexError::InsufficientFunds {
                required: quote.base_amount,
                available,
            });
        }

        let timeout = self.config.settlement.timeout;
        let mut receipt = tokio::time::timeout(timeout, self.settle(user, &quote))
            .await
            .map_err(|_| {
                AbanexError::Timeout(format!("settlement did not finish within {:?}", timeout))
            })??;

        self.replenish(&quote.target.ticker).await;
        receipt.advance(PurchasePhase::ReplenishChecked);
        Ok(receipt)
    }

    async fn settle(&self, user: UserId, quote: &Quote) -> Result<PurchaseReceipt> {
        let buyer = Owner::User(user);
        let mut legs = Vec::with_capacity(2);
        if quote.base_amount > Decimal::ZERO {
            legs.push(Transfer::new(
                buyer,
                Owner::Treasury,
                quote.base.ticker.clone(),
                quote.base_amount,
            ));
        }
        legs.push(Transfer::new(
            Owner::Treasury,
            buyer,
            quote.target.ticker.clone(),
            quote.amount,
        ));

        let mut txn = self.transfers.begin(&legs).await?;
        for leg in &legs {
            TransferEngine::apply(&mut txn, leg)?;
        }
        let unit_id = txn.id();
        txn.commit().await?;

        let mut receipt = PurchaseReceipt {
            id: PurchaseId::new(),
            user,
            currency: quote.target.ticker.clone(),
            amount: quote.amount,
            base_currency: quote.base.ticker.clone(),
            base_amount: quote.base_amount,
            unit_id,
            phase: PurchasePhase::Priced,
            timestamp: Utc::now(),
        };
        receipt.advance(PurchasePhase::Settled);
        Ok(receipt)
    }

    async fn replenish(&self, ticker: &Ticker) {
        match &self.replenishment {
            Replenishment::Inline(provider) => {
                if let Err(e) = self
                    .replenisher
                    .maybe_replenish(ticker, provider.as_ref())
                    .await
                {
                    error!(ticker = %ticker, error = %e, "Replenishment check failed");
                }
            }
            Replenishment::Queued(queue) => {
                queue.enqueue(ticker.clone());
            }
        }
    }

    /// Wait for replenishment checks queued so far. No-op in inline mode.
    pub async fn flush_replenishment(&self) {
        if let Replenishment::Queued(queue) = &self.replenishment {
            queue.flush().await;
        }
    }

    /// Stop the replenishment worker, if any, after it drains its queue,
    /// and stop pruning idle record locks.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        if let Some(cleanup) = self.lock_cleanup.lock().take() {
            cleanup.abort();
        }
    }
}

impl Drop for PurchaseOrchestrator {
    fn drop(&mut self) {
        if let Some(cleanup) = self.lock_cleanup.get_mut().take() {
            cleanup.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abanex_ledger::{LockConfig, MemoryStore};
    use abanex_market::LedgerExchange;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn ticker(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    async fn orchestrator(threshold: Decimal) -> PurchaseOrchestrator {
        let catalog = Arc::new(
            CurrencyCatalog::with_currencies([
                Currency::new(ticker("USD"), "US Dollar", dec!(1)),
                Currency::new(ticker("BTC"), "Bitcoin", dec!(25000)),
            ])
            .unwrap(),
        );
        let ledger = Arc::new(BalanceLedger::in_memory());
        let exchange = Arc::new(LedgerExchange::new(catalog.clone(), ledger.clone(), dec!(10)));
        let config = TreasuryConfig::new(ticker("USD"), dec!(10), threshold);
        PurchaseOrchestrator::new(config, catalog, ledger, exchange).unwrap()
    }

    #[test]
    fn test_phase_transitions() {
        assert!(PurchasePhase::Priced.can_transition_to(PurchasePhase::Settled));
        assert!(PurchasePhase::Settled.can_transition_to(PurchasePhase::ReplenishChecked));
        assert!(!PurchasePhase::Priced.can_transition_to(PurchasePhase::ReplenishChecked));
        assert!(!PurchasePhase::ReplenishChecked.can_transition_to(PurchasePhase::Priced));
    }

    #[test]
    fn test_request_parsing() {
        let request: PurchaseRequest =
            serde_json::from_str(r#"{"currency_ticker": "BTC", "amount": "0.5"}"#).unwrap();
        let (ticker, amount) = request.parse().unwrap();
        assert_eq!(ticker.as_str(), "BTC");
        assert_eq!(amount, dec!(0.5));

        let too_long = PurchaseRequest {
            currency_ticker: "TOOLONGXX".to_string(),
            amount: dec!(1),
        };
        assert!(matches!(too_long.parse(), Err(AbanexError::InvalidTicker(_))));

        let negative = PurchaseRequest {
            currency_ticker: "BTC".to_string(),
            amount: dec!(-1),
        };
        assert!(matches!(negative.parse(), Err(AbanexError::InvalidAmount(_))));
    }

    #[test]
    fn test_response_messages() {
        let ok = serde_json::to_value(PurchaseResponse::success()).unwrap();
        assert_eq!(ok["message"], "Purchase successful.");

        let err = PurchaseResponse::from_error(&AbanexError::InsufficientFunds {
            required: dec!(1),
            available: dec!(0),
        });
        assert_eq!(err.message, "Insufficient Funds!");
    }

    #[tokio::test]
    async fn test_quote() {
        let orchestrator = orchestrator(dec!(1000000)).await;
        let quote = orchestrator.quote(&ticker("BTC"), dec!(0.0001)).unwrap();
        assert_eq!(quote.required_funds, dec!(2.5));
        assert_eq!(quote.base_amount, dec!(2.5));
    }

    #[tokio::test]
    async fn test_missing_base_currency_is_misconfiguration() {
        let catalog = Arc::new(CurrencyCatalog::new());
        let ledger = Arc::new(BalanceLedger::in_memory());
        let exchange = Arc::new(LedgerExchange::new(catalog.clone(), ledger.clone(), dec!(10)));
        let config = TreasuryConfig::new(ticker("USD"), dec!(10), dec!(5));

        let result = PurchaseOrchestrator::new(config, catalog, ledger, exchange);
        assert!(matches!(result, Err(AbanexError::MisconfiguredSystem(_))));
    }

    #[tokio::test]
    async fn test_purchase_moves_both_legs() {
        let orchestrator = orchestrator(dec!(1000000)).await;
        let user = UserId::new();
        let ledger = orchestrator.ledger().clone();
        ledger.increase(Owner::User(user), &ticker("USD"), dec!(100000)).await.unwrap();

        let receipt = orchestrator.execute(user, &ticker("BTC"), dec!(2)).await.unwrap();

        assert_eq!(receipt.base_amount, dec!(50000));
        assert_eq!(receipt.phase, PurchasePhase::ReplenishChecked);
        assert_eq!(ledger.balance(Owner::User(user), &ticker("USD")).await.unwrap(), dec!(50000));
        assert_eq!(ledger.balance(Owner::User(user), &ticker("BTC")).await.unwrap(), dec!(2));
        assert_eq!(ledger.journal().entries_for_unit(receipt.unit_id).len(), 4);
        assert_eq!(orchestrator.metrics().snapshot().purchases_succeeded, 1);
    }

    #[tokio::test]
    async fn test_unaffordable_purchase_changes_nothing() {
        let orchestrator = orchestrator(dec!(1000000)).await;
        let user = UserId::new();
        let ledger = orchestrator.ledger().clone();
        ledger.increase(Owner::User(user), &ticker("USD"), dec!(100)).await.unwrap();

        let err = orchestrator.execute(user, &ticker("BTC"), dec!(1)).await.unwrap_err();

        assert_eq!(err.http_status(), 403);
        assert_eq!(ledger.balance(Owner::User(user), &ticker("USD")).await.unwrap(), dec!(100));
        assert_eq!(ledger.balance(Owner::Treasury, &ticker("BTC")).await.unwrap(), dec!(0));
        assert_eq!(orchestrator.metrics().snapshot().purchases_insufficient_funds, 1);
    }

    #[tokio::test]
    async fn test_malformed_request_is_bad_request() {
        let orchestrator = orchestrator(dec!(5)).await;
        let request = PurchaseRequest {
            currency_ticker: "B-T-C".to_string(),
            amount: dec!(1),
        };

        let err = orchestrator.execute_request(UserId::new(), &request).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(orchestrator.metrics().snapshot().purchases_invalid, 1);
    }

    #[tokio::test]
    async fn test_oversized_purchase_is_an_error() {
        let orchestrator = Arc::new(orchestrator(dec!(5)).await);
        let user = UserId::new();
        let ledger = orchestrator.ledger().clone();
        ledger.increase(Owner::User(user), &ticker("USD"), dec!(100)).await.unwrap();
        let huge = Decimal::from_i128_with_scale(10_i128.pow(25), 0);

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.execute(user, &ticker("BTC"), huge).await }
        });
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, AbanexError::InvalidAmount(_)));
        assert_eq!(err.http_status(), 400);
        assert_eq!(ledger.balance(Owner::User(user), &ticker("USD")).await.unwrap(), dec!(100));
        assert!(ledger.balance(Owner::User(user), &ticker("BTC")).await.unwrap().is_zero());
        assert_eq!(orchestrator.metrics().snapshot().purchases_invalid, 1);
    }

    #[tokio::test]
    async fn test_idle_record_locks_are_pruned_until_shutdown() {
        let catalog = Arc::new(
            CurrencyCatalog::with_currencies([
                Currency::new(ticker("USD"), "US Dollar", dec!(1)),
                Currency::new(ticker("BTC"), "Bitcoin", dec!(25000)),
            ])
            .unwrap(),
        );
        let lock_config = LockConfig {
            cleanup_interval: Duration::from_millis(10),
            ..LockConfig::default()
        };
        let ledger = Arc::new(BalanceLedger::new(Arc::new(MemoryStore::new()), lock_config));
        let exchange = Arc::new(LedgerExchange::new(catalog.clone(), ledger.clone(), dec!(10)));
        let config = TreasuryConfig::new(ticker("USD"), dec!(10), dec!(1000000));
        let orchestrator = PurchaseOrchestrator::new(config, catalog, ledger.clone(), exchange).unwrap();

        for _ in 0..20 {
            let user = UserId::new();
            ledger.increase(Owner::User(user), &ticker("USD"), dec!(10)).await.unwrap();
            orchestrator.execute(user, &ticker("BTC"), dec!(0.0001)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ledger.locks().tracked_count(), 0);
        assert_eq!(ledger.locks().held_count(), 0);

        orchestrator.shutdown().await;
        let user = UserId::new();
        ledger.increase(Owner::User(user), &ticker("USD"), dec!(10)).await.unwrap();
        orchestrator.execute(user, &ticker("BTC"), dec!(0.0001)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ledger.locks().tracked_count() > 0);
    }
}
