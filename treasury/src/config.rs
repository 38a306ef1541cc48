//! Treasury configuration.

use std::str::FromStr;
use std::time::Duration;

use abanex_common::{AbanexError, Result, Ticker};
use abanex_ledger::LockConfig;
use rust_decimal::Decimal;

/// Settlement configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Upper bound on one settlement unit, lock wait included.
    pub timeout: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Where replenishment checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishMode {
    /// Right after the purchase commits, on the purchasing task.
    Inline,
    /// On a background worker fed by a queue.
    Queued,
}

impl FromStr for ReplenishMode {
    type Err = AbanexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(ReplenishMode::Inline),
            "queued" => Ok(ReplenishMode::Queued),
            other => Err(AbanexError::MisconfiguredSystem(format!(
                "unknown replenish mode {:?}",
                other
            ))),
        }
    }
}

/// Replenishment configuration.
#[derive(Debug, Clone)]
pub struct ReplenishConfig {
    /// Treasury shortfall, in dollars, at which a buy is placed.
    pub debt_threshold: Decimal,
    /// Execution mode.
    pub mode: ReplenishMode,
    /// Worker queue capacity in queued mode.
    pub queue_capacity: usize,
}

impl ReplenishConfig {
    /// Inline replenishment with the given threshold.
    pub fn with_threshold(debt_threshold: Decimal) -> Self {
        Self {
            debt_threshold,
            mode: ReplenishMode::Inline,
            queue_capacity: 1024,
        }
    }
}

/// Main treasury configuration.
#[derive(Debug, Clone)]
pub struct TreasuryConfig {
    /// Currency users pay with.
    pub base_currency: Ticker,
    /// Smallest exchange order, in dollars.
    pub minimum_order_value: Decimal,
    /// Settlement configuration.
    pub settlement: SettlementConfig,
    /// Replenishment configuration.
    pub replenish: ReplenishConfig,
    /// Ledger lock configuration.
    pub lock: LockConfig,
    /// Log level.
    pub log_level: String,
}

impl TreasuryConfig {
    /// Create a configuration from the required settings, defaults elsewhere.
    pub fn new(base_currency: Ticker, minimum_order_value: Decimal, debt_threshold: Decimal) -> Self {
        Self {
            base_currency,
            minimum_order_value,
            settlement: SettlementConfig::default(),
            replenish: ReplenishConfig::with_threshold(debt_threshold),
            lock: LockConfig::default(),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                AbanexError::MisconfiguredSystem(format!("{} is not set", key))
            })
        };

        let base_currency = Ticker::parse(required("ABANEX_BASE_CURRENCY")?).map_err(|e| {
            AbanexError::MisconfiguredSystem(format!("ABANEX_BASE_CURRENCY: {}", e))
        })?;
        let minimum_order_value =
            parse_var("ABANEX_MINIMUM_ORDER_USD_VALUE", &required("ABANEX_MINIMUM_ORDER_USD_VALUE")?)?;
        let debt_threshold =
            parse_var("ABANEX_TREASURY_DEBT_THRESHOLD", &required("ABANEX_TREASURY_DEBT_THRESHOLD")?)?;

        let mut config = Self::new(base_currency, minimum_order_value, debt_threshold);

        if let Some(ms) = lookup("ABANEX_SETTLEMENT_TIMEOUT_MS") {
            config.settlement.timeout =
                Duration::from_millis(parse_var("ABANEX_SETTLEMENT_TIMEOUT_MS", &ms)?);
        }

        if let Some(ms) = lookup("ABANEX_LOCK_TIMEOUT_MS") {
            config.lock.acquire_timeout =
                Duration::from_millis(parse_var("ABANEX_LOCK_TIMEOUT_MS", &ms)?);
        }

        if let Some(mode) = lookup("ABANEX_REPLENISH_MODE") {
            config.replenish.mode = mode.parse()?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.minimum_order_value < Decimal::ZERO {
            return Err(AbanexError::MisconfiguredSystem(
                "Minimum order value cannot be negative".to_string(),
            ));
        }

        if self.replenish.debt_threshold < Decimal::ZERO {
            return Err(AbanexError::MisconfiguredSystem(
                "Debt threshold is a magnitude and cannot be negative".to_string(),
            ));
        }

        if self.settlement.timeout.is_zero() {
            return Err(AbanexError::MisconfiguredSystem(
                "Settlement timeout cannot be 0".to_string(),
            ));
        }

        if self.lock.acquire_timeout > self.settlement.timeout {
            return Err(AbanexError::MisconfiguredSystem(
                "Lock timeout cannot exceed settlement timeout".to_string(),
            ));
        }

        if self.replenish.queue_capacity == 0 {
            return Err(AbanexError::MisconfiguredSystem(
                "Replenish queue capacity cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AbanexError::MisconfiguredSystem(format!("{} has invalid value {:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("ABANEX_BASE_CURRENCY", "USD"),
        ("ABANEX_MINIMUM_ORDER_USD_VALUE", "10"),
        ("ABANEX_TREASURY_DEBT_THRESHOLD", "500.50"),
    ];

    #[test]
    fn test_required_settings() {
        let config = TreasuryConfig::from_lookup(env(&REQUIRED)).unwrap();
        assert_eq!(config.base_currency.as_str(), "USD");
        assert_eq!(config.minimum_order_value, dec!(10));
        assert_eq!(config.replenish.debt_threshold, dec!(500.50));
        assert_eq!(config.replenish.mode, ReplenishMode::Inline);
    }

    #[test]
    fn test_missing_setting_is_misconfiguration() {
        for skip in 0..REQUIRED.len() {
            let pairs: Vec<_> = REQUIRED
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, p)| *p)
                .collect();
            let err = TreasuryConfig::from_lookup(env(&pairs)).unwrap_err();
            assert!(matches!(err, AbanexError::MisconfiguredSystem(_)));
        }
    }

    #[test]
    fn test_unparsable_setting_is_misconfiguration() {
        let mut pairs = REQUIRED.to_vec();
        pairs[2] = ("ABANEX_TREASURY_DEBT_THRESHOLD", "lots");
        assert!(TreasuryConfig::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn test_optional_settings() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("ABANEX_SETTLEMENT_TIMEOUT_MS", "2000"));
        pairs.push(("ABANEX_LOCK_TIMEOUT_MS", "500"));
        pairs.push(("ABANEX_REPLENISH_MODE", "Queued"));
        pairs.push(("LOG_LEVEL", "debug"));

        let config = TreasuryConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.settlement.timeout, Duration::from_millis(2000));
        assert_eq!(config.lock.acquire_timeout, Duration::from_millis(500));
        assert_eq!(config.replenish.mode, ReplenishMode::Queued);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = TreasuryConfig::new(Ticker::parse("USD").unwrap(), dec!(10), dec!(5));
        assert!(config.validate().is_ok());

        config.replenish.debt_threshold = dec!(-5);
        assert!(config.validate().is_err());

        config.replenish.debt_threshold = dec!(5);
        config.lock.acquire_timeout = config.settlement.timeout * 2;
        assert!(config.validate().is_err());
    }
}
