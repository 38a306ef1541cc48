//! Simulation scenarios.

use std::path::Path;

use abanex_common::{Currency, Ticker};
use abanex_treasury::{ReplenishMode, TreasuryConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A currency seeded into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencySpec {
    pub ticker: String,
    pub display_name: String,
    pub dollar_value: Decimal,
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Base currency ticker.
    pub base_currency: String,
    /// Exchange minimum order, in dollars.
    pub minimum_order_value: Decimal,
    /// Treasury debt threshold, in dollars.
    pub debt_threshold: Decimal,
    /// Run replenishment on the worker queue.
    #[serde(default)]
    pub queued_replenishment: bool,
    /// Log level used when RUST_LOG is unset.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Catalog contents.
    pub currencies: Vec<CurrencySpec>,
    /// Number of funded users.
    pub users: usize,
    /// Base currency deposited for each user.
    pub deposit: Decimal,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// One purchase by user index.
    Purchase {
        user: usize,
        currency: String,
        amount: Decimal,
    },
    /// Random purchases from concurrent buyers.
    RandomPurchases {
        count: usize,
        concurrency: usize,
        /// Largest purchase in ten-thousandths of a unit.
        max_units: u32,
    },
    /// Update a currency's dollar value.
    SetPrice { currency: String, dollar_value: Decimal },
    /// Inject a storage fault.
    InjectFault { fault_type: FaultType },
    /// Disarm all storage faults.
    ClearFaults,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Next ledger commit fails.
    CommitFailure,
    /// Next load of a treasury record fails.
    TreasuryLoadFailure { currency: String },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// A user's balance equals an amount.
    UserBalanceEquals {
        user: usize,
        currency: String,
        amount: Decimal,
    },
    /// The treasury's balance equals an amount.
    TreasuryBalanceEquals { currency: String, amount: Decimal },
    /// At least this many exchange buys were filled.
    MinReplenishOrders { count: u64 },
    /// Supply of every currency matches deposits plus exchange buys.
    Conservation,
}

impl Scenario {
    /// Load a built-in scenario by name, or a JSON scenario file by path.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "simple-purchase" => Ok(Self::simple_purchase()),
            "replenishment" => Ok(Self::replenishment()),
            "high-volume" => Ok(Self::high_volume()),
            "failure-recovery" => Ok(Self::failure_recovery()),
            path if path.ends_with(".json") => Self::from_file(Path::new(path)),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Parse a scenario file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Treasury configuration for this scenario.
    pub fn config(&self) -> anyhow::Result<TreasuryConfig> {
        let mut config = TreasuryConfig::new(
            Ticker::parse(self.base_currency.as_str())?,
            self.minimum_order_value,
            self.debt_threshold,
        );
        if self.queued_replenishment {
            config.replenish.mode = ReplenishMode::Queued;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Catalog contents for this scenario.
    pub fn catalog(&self) -> anyhow::Result<Vec<Currency>> {
        self.currencies
            .iter()
            .map(|spec| {
                Ok(Currency::new(
                    Ticker::parse(spec.ticker.as_str())?,
                    spec.display_name.clone(),
                    spec.dollar_value,
                ))
            })
            .collect()
    }

    fn standard_currencies() -> Vec<CurrencySpec> {
        vec![
            CurrencySpec {
                ticker: "USD".to_string(),
                display_name: "US Dollar".to_string(),
                dollar_value: Decimal::ONE,
            },
            CurrencySpec {
                ticker: "BTC".to_string(),
                display_name: "Bitcoin".to_string(),
                dollar_value: Decimal::from(25_000),
            },
            CurrencySpec {
                ticker: "ETH".to_string(),
                display_name: "Ether".to_string(),
                dollar_value: Decimal::from(1_800),
            },
            CurrencySpec {
                ticker: "TOK".to_string(),
                display_name: "Token".to_string(),
                dollar_value: Decimal::TWO,
            },
        ]
    }

    /// One purchase with exact expected balances.
    fn simple_purchase() -> Self {
        Self {
            name: "simple-purchase".to_string(),
            description: "User with 100000 USD buys 2 BTC".to_string(),
            base_currency: "USD".to_string(),
            minimum_order_value: Decimal::from(10),
            debt_threshold: Decimal::from(1_000_000),
            queued_replenishment: false,
            log_level: None,
            currencies: Self::standard_currencies(),
            users: 1,
            deposit: Decimal::from(100_000),
            steps: vec![
                ScenarioStep::Purchase {
                    user: 0,
                    currency: "BTC".to_string(),
                    amount: Decimal::TWO,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::UserBalanceEquals {
                        user: 0,
                        currency: "USD".to_string(),
                        amount: Decimal::from(50_000),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::TreasuryBalanceEquals {
                        currency: "BTC".to_string(),
                        amount: Decimal::from(-2),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Conservation,
                },
            ],
        }
    }

    /// Debt crosses the threshold and triggers a buy.
    fn replenishment() -> Self {
        Self {
            name: "replenishment".to_string(),
            description: "Treasury token debt crosses 5 dollars".to_string(),
            base_currency: "USD".to_string(),
            minimum_order_value: Decimal::ONE,
            debt_threshold: Decimal::from(5),
            queued_replenishment: false,
            log_level: None,
            currencies: Self::standard_currencies(),
            users: 2,
            deposit: Decimal::from(100),
            steps: vec![
                ScenarioStep::Purchase {
                    user: 0,
                    currency: "TOK".to_string(),
                    amount: Decimal::TWO,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::TreasuryBalanceEquals {
                        currency: "TOK".to_string(),
                        amount: Decimal::from(-2),
                    },
                },
                ScenarioStep::Purchase {
                    user: 1,
                    currency: "TOK".to_string(),
                    amount: Decimal::ONE,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::MinReplenishOrders { count: 1 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::TreasuryBalanceEquals {
                        currency: "TOK".to_string(),
                        amount: Decimal::ZERO,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Conservation,
                },
            ],
        }
    }

    /// Many concurrent buyers with queued replenishment.
    fn high_volume() -> Self {
        Self {
            name: "high-volume".to_string(),
            description: "Concurrent random purchases with queued replenishment".to_string(),
            base_currency: "USD".to_string(),
            minimum_order_value: Decimal::from(10),
            debt_threshold: Decimal::from(50_000),
            queued_replenishment: true,
            log_level: None,
            currencies: Self::standard_currencies(),
            users: 50,
            deposit: Decimal::from(250_000),
            steps: vec![
                ScenarioStep::RandomPurchases {
                    count: 5_000,
                    concurrency: 32,
                    max_units: 20_000,
                },
                ScenarioStep::SetPrice {
                    currency: "BTC".to_string(),
                    dollar_value: Decimal::from(30_000),
                },
                ScenarioStep::RandomPurchases {
                    count: 5_000,
                    concurrency: 32,
                    max_units: 20_000,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Conservation,
                },
            ],
        }
    }

    /// Storage faults during settlement leave no trace.
    fn failure_recovery() -> Self {
        Self {
            name: "failure-recovery".to_string(),
            description: "Purchases under injected storage faults".to_string(),
            base_currency: "USD".to_string(),
            minimum_order_value: Decimal::from(10),
            debt_threshold: Decimal::from(1_000_000),
            queued_replenishment: false,
            log_level: None,
            currencies: Self::standard_currencies(),
            users: 1,
            deposit: Decimal::from(100_000),
            steps: vec![
                ScenarioStep::InjectFault {
                    fault_type: FaultType::CommitFailure,
                },
                // Fails and leaves balances untouched.
                ScenarioStep::Purchase {
                    user: 0,
                    currency: "BTC".to_string(),
                    amount: Decimal::ONE,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::UserBalanceEquals {
                        user: 0,
                        currency: "USD".to_string(),
                        amount: Decimal::from(100_000),
                    },
                },
                ScenarioStep::InjectFault {
                    fault_type: FaultType::TreasuryLoadFailure {
                        currency: "BTC".to_string(),
                    },
                },
                ScenarioStep::Purchase {
                    user: 0,
                    currency: "BTC".to_string(),
                    amount: Decimal::ONE,
                },
                ScenarioStep::ClearFaults,
                ScenarioStep::Wait { millis: 100 },
                // Retry succeeds.
                ScenarioStep::Purchase {
                    user: 0,
                    currency: "BTC".to_string(),
                    amount: Decimal::ONE,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::UserBalanceEquals {
                        user: 0,
                        currency: "USD".to_string(),
                        amount: Decimal::from(75_000),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Conservation,
                },
            ],
        }
    }
}
