//! Abanex Market
//!
//! Currency catalog and the exchange the treasury buys from.
//!
//! # Example
//!
//! ```rust,ignore
//! use abanex_market::{CurrencyCatalog, LedgerExchange, ReplenishmentOrder};
//!
//! let catalog = Arc::new(CurrencyCatalog::with_currencies(currencies)?);
//! let exchange = LedgerExchange::new(catalog.clone(), ledger, dec!(10));
//! exchange.buy(&ReplenishmentOrder::new(btc, dec!(3))).await?;
//! ```

pub mod catalog;
pub mod error;
pub mod exchange;

pub use catalog::{CurrencyCatalog, CurrencyListing};
pub use error::{MarketError, MarketResult};
pub use exchange::{BuyReceipt, ExchangeProvider, LedgerExchange, ReplenishmentOrder};
