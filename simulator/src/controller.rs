//! Simulation controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use abanex_common::{Owner, Ticker, UserId};
use abanex_ledger::{BalanceKey, BalanceLedger, FailPoint, FaultyStore, MemoryStore};
use abanex_market::{CurrencyCatalog, LedgerExchange};
use abanex_treasury::{MetricsSnapshot, PurchaseOrchestrator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

/// A currency whose supply does not match deposits plus exchange buys.
#[derive(Debug, Clone, PartialEq)]
pub struct ConservationViolation {
    pub currency: Ticker,
    pub expected: Decimal,
    pub actual: Decimal,
}

/// Controls the simulation.
pub struct SimulationController {
    /// Simulation speed multiplier.
    speed: f64,
    /// Random number generator.
    rng: Mutex<StdRng>,
    /// Storage with fault injection.
    store: Arc<FaultyStore<MemoryStore>>,
    /// Ledger.
    ledger: Arc<BalanceLedger>,
    /// Exchange the treasury buys from.
    exchange: Arc<LedgerExchange>,
    /// Orchestrator under test.
    orchestrator: Arc<PurchaseOrchestrator>,
    /// Funded users.
    users: Vec<UserId>,
    /// Deposits per currency.
    deposits: BTreeMap<Ticker, Decimal>,
    /// Simulation metrics.
    metrics: Mutex<SimulationMetrics>,
    /// Wall time spent issuing purchases.
    busy: Mutex<Duration>,
}

impl SimulationController {
    /// Build the system described by a scenario and fund its users.
    pub async fn new(scenario: &Scenario, speed: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let config = scenario.config()?;
        let catalog = Arc::new(CurrencyCatalog::with_currencies(scenario.catalog()?)?);
        let store = Arc::new(FaultyStore::new(MemoryStore::new()));
        let ledger = Arc::new(BalanceLedger::new(store.clone(), config.lock.clone()));
        let exchange = Arc::new(LedgerExchange::new(
            catalog.clone(),
            ledger.clone(),
            config.minimum_order_value,
        ));
        let base = config.base_currency.clone();
        let orchestrator = Arc::new(PurchaseOrchestrator::new(
            config,
            catalog,
            ledger.clone(),
            exchange.clone(),
        )?);

        let mut users = Vec::with_capacity(scenario.users);
        for _ in 0..scenario.users {
            let user = UserId::new();
            ledger
                .increase(Owner::User(user), &base, scenario.deposit)
                .await?;
            users.push(user);
        }

        let mut deposits = BTreeMap::new();
        deposits.insert(base, scenario.deposit * Decimal::from(scenario.users));

        info!(
            scenario = %scenario.name,
            users = users.len(),
            deposit = %scenario.deposit,
            "Simulation initialized"
        );

        Ok(Self {
            speed,
            rng: Mutex::new(rng),
            store,
            ledger,
            exchange,
            orchestrator,
            users,
            deposits,
            metrics: Mutex::new(SimulationMetrics::new()),
            busy: Mutex::new(Duration::ZERO),
        })
    }

    /// Run every step of a scenario.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        self.orchestrator.shutdown().await;
        Ok(())
    }

    /// Execute a single scenario step.
    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                let adjusted = (*millis as f64 / self.speed) as u64;
                tokio::time::sleep(Duration::from_millis(adjusted)).await;
            }
            ScenarioStep::Purchase {
                user,
                currency,
                amount,
            } => {
                let user = self.user(*user)?;
                let ticker = Ticker::parse(currency.as_str())?;
                let started = Instant::now();
                let result = self.orchestrator.execute(user, &ticker, *amount).await;
                self.record(result.as_ref().map(|_| ()), started.elapsed()).await;
                if let Err(e) = result {
                    info!(error = %e, "Scripted purchase failed");
                }
            }
            ScenarioStep::RandomPurchases {
                count,
                concurrency,
                max_units,
            } => {
                self.random_purchases(*count, *concurrency, *max_units).await?;
            }
            ScenarioStep::SetPrice {
                currency,
                dollar_value,
            } => {
                let ticker = Ticker::parse(currency.as_str())?;
                self.orchestrator
                    .catalog()
                    .set_dollar_value(&ticker, *dollar_value)?;
                info!(currency = %ticker, dollar_value = %dollar_value, "Price updated");
            }
            ScenarioStep::InjectFault { fault_type } => {
                info!("Injecting fault {:?}", fault_type);
                let point = match fault_type {
                    FaultType::CommitFailure => FailPoint::Commit,
                    FaultType::TreasuryLoadFailure { currency } => {
                        FailPoint::Load(BalanceKey::treasury(Ticker::parse(currency.as_str())?))
                    }
                };
                self.store.inject(point);
            }
            ScenarioStep::ClearFaults => {
                info!("Clearing faults");
                self.store.clear();
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
            }
        }

        Ok(())
    }

    /// Run `count` random purchases spread over `concurrency` buyers.
    async fn random_purchases(
        &self,
        count: usize,
        concurrency: usize,
        max_units: u32,
    ) -> anyhow::Result<()> {
        let targets: Vec<Ticker> = self
            .orchestrator
            .catalog()
            .list()
            .into_iter()
            .map(|listing| listing.ticker)
            .filter(|ticker| ticker != &self.orchestrator.config().base_currency)
            .collect();
        if targets.is_empty() || self.users.is_empty() || concurrency == 0 {
            warn!("Nothing to buy or nobody to buy it");
            return Ok(());
        }

        info!(count, concurrency, "Generating random purchases");

        let per_buyer = count / concurrency;
        let remainder = count % concurrency;
        let mut seeds = Vec::with_capacity(concurrency);
        {
            let mut rng = self.rng.lock().await;
            for _ in 0..concurrency {
                seeds.push(rng.gen::<u64>());
            }
        }

        let buyers = seeds.into_iter().enumerate().map(|(i, seed)| {
            let quota = per_buyer + usize::from(i < remainder);
            let orchestrator = self.orchestrator.clone();
            let users = self.users.clone();
            let targets = targets.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut local = SimulationMetrics::new();
                for _ in 0..quota {
                    let user = users[rng.gen_range(0..users.len())];
                    let ticker = &targets[rng.gen_range(0..targets.len())];
                    let amount = Decimal::new(rng.gen_range(1..=max_units.max(1)) as i64, 4);

                    let started = Instant::now();
                    match orchestrator.execute(user, ticker, amount).await {
                        Ok(_) => local.record_success(started.elapsed().as_micros() as u64),
                        Err(e) => local.record_failure(&e),
                    }
                }
                local
            })
        });

        let started = Instant::now();
        let results = futures::future::join_all(buyers).await;
        *self.busy.lock().await += started.elapsed();

        let mut metrics = self.metrics.lock().await;
        for result in results {
            metrics.merge(&result?);
        }
        Ok(())
    }

    async fn record(&self, result: Result<(), &abanex_common::AbanexError>, elapsed: Duration) {
        let mut metrics = self.metrics.lock().await;
        match result {
            Ok(()) => metrics.record_success(elapsed.as_micros() as u64),
            Err(e) => metrics.record_failure(e),
        }
        *self.busy.lock().await += elapsed;
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        self.orchestrator.flush_replenishment().await;
        match condition {
            AssertCondition::UserBalanceEquals {
                user,
                currency,
                amount,
            } => {
                let owner = Owner::User(self.user(*user)?);
                self.expect_balance(owner, currency, *amount).await
            }
            AssertCondition::TreasuryBalanceEquals { currency, amount } => {
                self.expect_balance(Owner::Treasury, currency, *amount).await
            }
            AssertCondition::MinReplenishOrders { count } => {
                let orders = self.orchestrator.metrics().snapshot().replenish_orders;
                if orders < *count {
                    anyhow::bail!("expected at least {} replenish orders, saw {}", count, orders);
                }
                Ok(())
            }
            AssertCondition::Conservation => {
                let violations = self.verify_conservation().await?;
                if !violations.is_empty() {
                    anyhow::bail!("conservation violated: {:?}", violations);
                }
                Ok(())
            }
        }
    }

    async fn expect_balance(&self, owner: Owner, currency: &str, expected: Decimal) -> anyhow::Result<()> {
        let actual = self
            .ledger
            .balance(owner, &Ticker::parse(currency)?)
            .await?;
        if actual != expected {
            anyhow::bail!("{} {} balance is {}, expected {}", owner, currency, actual, expected);
        }
        info!(owner = %owner, currency, balance = %actual, "Balance assertion passed");
        Ok(())
    }

    /// Compare every currency's supply with deposits plus exchange buys.
    pub async fn verify_conservation(&self) -> anyhow::Result<Vec<ConservationViolation>> {
        self.orchestrator.flush_replenishment().await;
        let mut violations = Vec::new();
        for listing in self.orchestrator.catalog().list() {
            let deposited = self
                .deposits
                .get(&listing.ticker)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let expected = deposited + self.exchange.bought(&listing.ticker);
            let actual = self.ledger.total_supply(&listing.ticker).await?;
            if actual != expected {
                warn!(currency = %listing.ticker, %expected, %actual, "Conservation violated");
                violations.push(ConservationViolation {
                    currency: listing.ticker,
                    expected,
                    actual,
                });
            }
        }
        if !self.ledger.verify_integrity() {
            warn!(
                units = ?self.ledger.journal().unbalanced_units(),
                "Unbalanced transfer units in journal"
            );
            anyhow::bail!("journal integrity check failed");
        }
        Ok(violations)
    }

    fn user(&self, index: usize) -> anyhow::Result<UserId> {
        self.users
            .get(index)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("scenario has no user #{}", index))
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.lock().await.clone()
    }

    /// Get orchestrator metrics.
    pub fn treasury_metrics(&self) -> MetricsSnapshot {
        self.orchestrator.metrics().snapshot()
    }

    /// Wall time spent issuing purchases.
    pub async fn busy_time(&self) -> Duration {
        *self.busy.lock().await
    }
}
