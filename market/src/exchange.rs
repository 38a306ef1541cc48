//! Exchange providers that fill treasury replenishment orders.

use std::sync::Arc;

use abanex_common::{OrderId, Owner, Ticker};
use abanex_ledger::BalanceLedger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::catalog::CurrencyCatalog;
use crate::error::{MarketError, MarketResult};

/// A whole-unit buy of one currency for the treasury.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplenishmentOrder {
    /// Currency to buy.
    pub ticker: Ticker,
    /// Units to buy.
    pub quantity: Decimal,
}

impl ReplenishmentOrder {
    /// Create a new order.
    pub fn new(ticker: Ticker, quantity: Decimal) -> Self {
        Self { ticker, quantity }
    }
}

/// Confirmation of a filled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyReceipt {
    /// Provider order ID.
    pub order_id: OrderId,
    /// Currency bought.
    pub ticker: Ticker,
    /// Units bought.
    pub quantity: Decimal,
    /// Dollar value of the fill.
    pub dollar_value: Decimal,
    /// Fill time.
    pub executed_at: DateTime<Utc>,
}

/// External exchange the treasury buys from.
///
/// A successful `buy` has already credited the treasury balance of the
/// currency by the order quantity.
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Place a buy order.
    async fn buy(&self, order: &ReplenishmentOrder) -> MarketResult<BuyReceipt>;
}

/// Provider that fills every acceptable order at catalog price and books
/// the fill straight into the ledger.
pub struct LedgerExchange {
    catalog: Arc<CurrencyCatalog>,
    ledger: Arc<BalanceLedger>,
    minimum_order_value: Decimal,
    fills: RwLock<Vec<BuyReceipt>>,
}

impl LedgerExchange {
    /// Create a new provider with a minimum order dollar value.
    pub fn new(
        catalog: Arc<CurrencyCatalog>,
        ledger: Arc<BalanceLedger>,
        minimum_order_value: Decimal,
    ) -> Self {
        Self {
            catalog,
            ledger,
            minimum_order_value,
            fills: RwLock::new(Vec::new()),
        }
    }

    /// Minimum order dollar value.
    pub fn minimum_order_value(&self) -> Decimal {
        self.minimum_order_value
    }

    /// Filled orders, oldest first.
    pub fn fills(&self) -> Vec<BuyReceipt> {
        self.fills.read().clone()
    }

    /// Total units bought of one currency.
    pub fn bought(&self, ticker: &Ticker) -> Decimal {
        self.fills
            .read()
            .iter()
            .filter(|fill| &fill.ticker == ticker)
            .map(|fill| fill.quantity)
            .sum()
    }
}

#[async_trait]
impl ExchangeProvider for LedgerExchange {
    fn name(&self) -> &str {
        "ledger"
    }

    #[instrument(skip(self), fields(ticker = %order.ticker, quantity = %order.quantity))]
    async fn buy(&self, order: &ReplenishmentOrder) -> MarketResult<BuyReceipt> {
        if order.quantity <= Decimal::ZERO || !order.quantity.fract().is_zero() {
            return Err(MarketError::InvalidQuantity(order.quantity));
        }

        let currency = self.catalog.lookup(&order.ticker)?;
        let value = currency.in_dollars(order.quantity)?;
        if value < self.minimum_order_value {
            warn!(
                value = %value,
                minimum = %self.minimum_order_value,
                "Order below minimum value"
            );
            return Err(MarketError::OrderTooSmall {
                value,
                minimum: self.minimum_order_value,
            });
        }

        self.ledger
            .increase(Owner::Treasury, &order.ticker, order.quantity)
            .await?;

        let receipt = BuyReceipt {
            order_id: OrderId::new(),
            ticker: order.ticker.clone(),
            quantity: order.quantity,
            dollar_value: value,
            executed_at: Utc::now(),
        };
        info!(order_id = %receipt.order_id, value = %value, "Buy order filled");
        self.fills.write().push(receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abanex_common::Currency;
    use abanex_ledger::{FailPoint, FaultyStore, LockConfig, MemoryStore};
    use rust_decimal_macros::dec;

    fn ticker(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    fn setup(ledger: Arc<BalanceLedger>) -> LedgerExchange {
        let catalog = CurrencyCatalog::with_currencies([Currency::new(
            ticker("BTC"),
            "Bitcoin",
            dec!(2),
        )])
        .unwrap();
        LedgerExchange::new(Arc::new(catalog), ledger, dec!(10))
    }

    #[tokio::test]
    async fn test_buy_credits_treasury() {
        let ledger = Arc::new(BalanceLedger::in_memory());
        let exchange = setup(ledger.clone());

        let receipt = exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(100)))
            .await
            .unwrap();

        assert_eq!(receipt.dollar_value, dec!(200));
        assert_eq!(
            ledger.balance(Owner::Treasury, &ticker("BTC")).await.unwrap(),
            dec!(100)
        );
        assert_eq!(exchange.bought(&ticker("BTC")), dec!(100));
    }

    #[tokio::test]
    async fn test_buy_adds_to_existing_balance() {
        let ledger = Arc::new(BalanceLedger::in_memory());
        ledger
            .increase(Owner::Treasury, &ticker("BTC"), dec!(50))
            .await
            .unwrap();
        let exchange = setup(ledger.clone());

        exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(100)))
            .await
            .unwrap();

        assert_eq!(
            ledger.balance(Owner::Treasury, &ticker("BTC")).await.unwrap(),
            dec!(150)
        );
    }

    #[tokio::test]
    async fn test_order_below_minimum_rejected() {
        let ledger = Arc::new(BalanceLedger::in_memory());
        let exchange = setup(ledger.clone());

        let err = exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(4)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MarketError::OrderTooSmall { value, minimum } if value == dec!(8) && minimum == dec!(10)
        ));
        assert_eq!(
            ledger.balance(Owner::Treasury, &ticker("BTC")).await.unwrap(),
            dec!(0)
        );
        assert!(exchange.fills().is_empty());
    }

    #[tokio::test]
    async fn test_order_at_minimum_accepted() {
        let exchange = setup(Arc::new(BalanceLedger::in_memory()));
        assert!(exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(5)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fractional_quantity_rejected() {
        let exchange = setup(Arc::new(BalanceLedger::in_memory()));
        let err = exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(4.5)))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidQuantity(_)));
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let exchange = setup(Arc::new(BalanceLedger::in_memory()));
        let err = exchange
            .buy(&ReplenishmentOrder::new(ticker("ETH"), dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::CurrencyNotFound(_)));
    }

    #[tokio::test]
    async fn test_ledger_failure_records_no_fill() {
        let store = Arc::new(FaultyStore::new(MemoryStore::new()));
        let ledger = Arc::new(BalanceLedger::new(store.clone(), LockConfig::default()));
        let exchange = setup(ledger.clone());

        store.inject(FailPoint::Commit);
        let err = exchange
            .buy(&ReplenishmentOrder::new(ticker("BTC"), dec!(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, MarketError::Ledger(_)));
        assert!(exchange.fills().is_empty());
    }
}
