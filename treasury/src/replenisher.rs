//! Treasury replenishment policy.
//!
//! After a purchase the treasury may hold a negative balance of the bought
//! currency. Once that debt, valued in dollars, reaches the configured
//! threshold, a whole-unit buy covering it is placed with the exchange.

use std::sync::Arc;

use abanex_common::{checked_quotient, Owner, Result, Ticker};
use abanex_ledger::BalanceLedger;
use abanex_market::{BuyReceipt, CurrencyCatalog, ExchangeProvider, MarketError, ReplenishmentOrder};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::Metrics;

/// Result of one replenishment check.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplenishOutcome {
    /// Debt below threshold (or no debt at all).
    NotNeeded {
        /// Current shortfall in dollars; zero or negative when in credit.
        debt_dollars: Decimal,
    },
    /// A buy order was filled.
    Ordered(BuyReceipt),
    /// The exchange refused the order as too small.
    Rejected {
        /// Order value in dollars.
        value: Decimal,
        /// Exchange minimum.
        minimum: Decimal,
    },
}

impl ReplenishOutcome {
    /// Check if a buy was filled.
    pub fn is_ordered(&self) -> bool {
        matches!(self, ReplenishOutcome::Ordered(_))
    }
}

/// Decides when and how much the treasury buys.
pub struct TreasuryReplenisher {
    catalog: Arc<CurrencyCatalog>,
    ledger: Arc<BalanceLedger>,
    threshold: Decimal,
    metrics: Arc<Metrics>,
    /// Serializes checks per currency so concurrent checks see each other's fills.
    in_flight: DashMap<Ticker, Arc<Mutex<()>>>,
}

impl TreasuryReplenisher {
    /// Create a new replenisher. `threshold` is a dollar magnitude.
    pub fn new(
        catalog: Arc<CurrencyCatalog>,
        ledger: Arc<BalanceLedger>,
        threshold: Decimal,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            threshold: threshold.abs(),
            metrics,
            in_flight: DashMap::new(),
        }
    }

    /// Debt threshold in dollars.
    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Treasury shortfall of a currency in dollars. Negative when in credit.
    pub async fn debt_dollars(&self, ticker: &Ticker) -> Result<Decimal> {
        let currency = self.catalog.lookup(ticker)?;
        let balance = self.ledger.balance(Owner::Treasury, ticker).await?;
        Ok(-currency.in_dollars(balance)?)
    }

    /// Buy enough whole units to clear the treasury's debt in `ticker` when
    /// that debt has reached the threshold.
    ///
    /// An order refused as too small is reported as
    /// [`ReplenishOutcome::Rejected`]; other failures are returned.
    #[instrument(skip(self, provider), fields(provider = provider.name()))]
    pub async fn maybe_replenish(
        &self,
        ticker: &Ticker,
        provider: &dyn ExchangeProvider,
    ) -> Result<ReplenishOutcome> {
        self.metrics.replenish_checked();

        let gate = self.in_flight.entry(ticker.clone()).or_default().clone();
        let _serial = gate.lock().await;

        let outcome = self.check_and_buy(ticker, provider).await;
        if outcome.is_err() {
            self.metrics.replenish_failed();
        }
        outcome
    }

    async fn check_and_buy(
        &self,
        ticker: &Ticker,
        provider: &dyn ExchangeProvider,
    ) -> Result<ReplenishOutcome> {
        let currency = self.catalog.lookup(ticker)?;
        let balance = self.ledger.balance(Owner::Treasury, ticker).await?;
        let debt_dollars = -currency.in_dollars(balance)?;

        if debt_dollars <= Decimal::ZERO
            || debt_dollars < self.threshold
            || currency.dollar_value <= Decimal::ZERO
        {
            debug!(debt = %debt_dollars, threshold = %self.threshold, "No replenishment needed");
            return Ok(ReplenishOutcome::NotNeeded { debt_dollars });
        }

        let quantity = checked_quotient(debt_dollars, currency.dollar_value)?.ceil();
        let order = ReplenishmentOrder::new(ticker.clone(), quantity);

        match provider.buy(&order).await {
            Ok(receipt) => {
                self.metrics.replenish_ordered();
                info!(
                    order_id = %receipt.order_id,
                    quantity = %quantity,
                    debt = %debt_dollars,
                    "Treasury replenished"
                );
                Ok(ReplenishOutcome::Ordered(receipt))
            }
            Err(MarketError::OrderTooSmall { value, minimum }) => {
                self.metrics.replenish_rejected();
                warn!(
                    value = %value,
                    minimum = %minimum,
                    "Replenishment order below exchange minimum"
                );
                Ok(ReplenishOutcome::Rejected { value, minimum })
            }
            Err(e) => {
                error!(error = %e, quantity = %quantity, "Replenishment order failed");
                Err(e.into())
            }
        }
    }
}
