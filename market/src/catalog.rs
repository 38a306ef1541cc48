//! Registry of tradable currencies and their dollar values.

use abanex_common::{AbanexError, Currency, Result, Ticker};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MarketError, MarketResult};

/// Public view of a currency for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyListing {
    /// Ticker symbol.
    pub ticker: Ticker,
    /// Human readable name.
    pub display_name: String,
    /// Value of one unit in dollars.
    pub dollar_value: Decimal,
}

impl From<&Currency> for CurrencyListing {
    fn from(currency: &Currency) -> Self {
        Self {
            ticker: currency.ticker.clone(),
            display_name: currency.display_name.clone(),
            dollar_value: currency.dollar_value,
        }
    }
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    currency: Currency,
    priced_at: DateTime<Utc>,
}

/// Thread-safe currency catalog keyed by ticker.
#[derive(Default)]
pub struct CurrencyCatalog {
    currencies: DashMap<Ticker, CatalogEntry>,
}

impl CurrencyCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog from a list of currencies.
    pub fn with_currencies(currencies: impl IntoIterator<Item = Currency>) -> MarketResult<Self> {
        let catalog = Self::new();
        for currency in currencies {
            catalog.register(currency)?;
        }
        Ok(catalog)
    }

    /// Register a new currency. Tickers are immutable once registered.
    pub fn register(&self, currency: Currency) -> MarketResult<()> {
        if currency.dollar_value < Decimal::ZERO {
            return Err(MarketError::InvalidDollarValue {
                ticker: currency.ticker,
                value: currency.dollar_value,
            });
        }

        match self.currencies.entry(currency.ticker.clone()) {
            Entry::Occupied(_) => Err(MarketError::DuplicateTicker(currency.ticker)),
            Entry::Vacant(slot) => {
                info!(
                    ticker = %currency.ticker,
                    dollar_value = %currency.dollar_value,
                    "Currency registered"
                );
                slot.insert(CatalogEntry {
                    currency,
                    priced_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Look up a currency.
    pub fn lookup(&self, ticker: &Ticker) -> MarketResult<Currency> {
        self.currencies
            .get(ticker)
            .map(|entry| entry.currency.clone())
            .ok_or_else(|| MarketError::CurrencyNotFound(ticker.clone()))
    }

    /// Dollar value of one unit of a currency.
    pub fn dollar_value(&self, ticker: &Ticker) -> MarketResult<Decimal> {
        self.currencies
            .get(ticker)
            .map(|entry| entry.currency.dollar_value)
            .ok_or_else(|| MarketError::CurrencyNotFound(ticker.clone()))
    }

    /// When the dollar value was last set.
    pub fn priced_at(&self, ticker: &Ticker) -> MarketResult<DateTime<Utc>> {
        self.currencies
            .get(ticker)
            .map(|entry| entry.priced_at)
            .ok_or_else(|| MarketError::CurrencyNotFound(ticker.clone()))
    }

    /// Update the dollar value of a registered currency.
    pub fn set_dollar_value(&self, ticker: &Ticker, value: Decimal) -> MarketResult<()> {
        if value < Decimal::ZERO {
            return Err(MarketError::InvalidDollarValue {
                ticker: ticker.clone(),
                value,
            });
        }

        let mut entry = self
            .currencies
            .get_mut(ticker)
            .ok_or_else(|| MarketError::CurrencyNotFound(ticker.clone()))?;
        debug!(
            ticker = %ticker,
            old = %entry.currency.dollar_value,
            new = %value,
            "Dollar value updated"
        );
        entry.currency.dollar_value = value;
        entry.priced_at = Utc::now();
        Ok(())
    }

    /// All currencies, sorted by ticker.
    pub fn list(&self) -> Vec<CurrencyListing> {
        let mut listings: Vec<CurrencyListing> = self
            .currencies
            .iter()
            .map(|entry| CurrencyListing::from(&entry.currency))
            .collect();
        listings.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        listings
    }

    /// Resolve a ticker that configuration depends on.
    pub fn require(&self, ticker: &Ticker) -> Result<Currency> {
        self.lookup(ticker).map_err(|_| {
            AbanexError::MisconfiguredSystem(format!("currency {} is not registered", ticker))
        })
    }

    /// Number of registered currencies.
    pub fn len(&self) -> usize {
        self.currencies.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(s: &str) -> Ticker {
        Ticker::parse(s).unwrap()
    }

    fn catalog() -> CurrencyCatalog {
        CurrencyCatalog::with_currencies([
            Currency::new(ticker("USD"), "US Dollar", dec!(1)),
            Currency::new(ticker("BTC"), "Bitcoin", dec!(25000)),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup() {
        let catalog = catalog();
        assert_eq!(catalog.lookup(&ticker("BTC")).unwrap().display_name, "Bitcoin");
        assert_eq!(catalog.dollar_value(&ticker("USD")).unwrap(), dec!(1));
        assert!(matches!(
            catalog.lookup(&ticker("DOGE")),
            Err(MarketError::CurrencyNotFound(_))
        ));
    }

    #[test]
    fn test_tickers_are_case_sensitive() {
        let catalog = catalog();
        assert!(catalog.lookup(&ticker("btc")).is_err());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let catalog = catalog();
        let err = catalog
            .register(Currency::new(ticker("BTC"), "Other", dec!(1)))
            .unwrap_err();
        assert!(matches!(err, MarketError::DuplicateTicker(_)));
        assert_eq!(catalog.dollar_value(&ticker("BTC")).unwrap(), dec!(25000));
    }

    #[test]
    fn test_set_dollar_value() {
        let catalog = catalog();
        let before = catalog.priced_at(&ticker("BTC")).unwrap();

        catalog.set_dollar_value(&ticker("BTC"), dec!(30000)).unwrap();
        assert_eq!(catalog.dollar_value(&ticker("BTC")).unwrap(), dec!(30000));
        assert!(catalog.priced_at(&ticker("BTC")).unwrap() >= before);

        assert!(catalog.set_dollar_value(&ticker("BTC"), dec!(-1)).is_err());
        assert!(catalog.set_dollar_value(&ticker("ETH"), dec!(1)).is_err());
        // Zero is a valid price.
        catalog.set_dollar_value(&ticker("BTC"), dec!(0)).unwrap();
    }

    #[test]
    fn test_list_sorted_and_serializable() {
        let listings = catalog().list();
        assert_eq!(listings[0].ticker.as_str(), "BTC");
        assert_eq!(listings[1].ticker.as_str(), "USD");

        let json = serde_json::to_value(&listings[0]).unwrap();
        assert_eq!(json["ticker"], "BTC");
        assert_eq!(json["display_name"], "Bitcoin");
    }

    #[test]
    fn test_require_reports_misconfiguration() {
        let catalog = catalog();
        assert!(catalog.require(&ticker("USD")).is_ok());
        assert!(matches!(
            catalog.require(&ticker("EUR")),
            Err(AbanexError::MisconfiguredSystem(_))
        ));
    }
}
