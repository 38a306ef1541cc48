//! Abanex Simulator
//!
//! Seeds a catalog and funded users from a scenario, drives purchases
//! through the orchestrator and checks that every currency's supply equals
//! deposits plus exchange buys.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::{Scenario, ScenarioStep};

/// Abanex Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Abanex purchase and replenishment simulator")]
struct Args {
    /// Built-in scenario name or path to a JSON scenario
    #[arg(short, long, default_value = "simple-purchase")]
    scenario: String,

    /// Override the number of funded users
    #[arg(short, long)]
    users: Option<usize>,

    /// Append a random-purchase phase of this many purchases
    #[arg(long)]
    purchases: Option<usize>,

    /// Concurrent buyers for the appended phase
    #[arg(long, default_value = "16")]
    concurrency: usize,

    /// Simulation speed multiplier for waits
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut scenario = Scenario::load(&args.scenario)?;
    let mut config = scenario.config()?;
    if let Some(level) = args.log_level.clone() {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    if let Some(users) = args.users {
        scenario.users = users;
    }
    if let Some(count) = args.purchases {
        scenario.steps.push(ScenarioStep::RandomPurchases {
            count,
            concurrency: args.concurrency,
            max_units: 10_000,
        });
    }

    info!("Starting Abanex Simulator");
    info!("Scenario: {}", scenario.name);
    info!("Users: {}", scenario.users);
    info!("Speed: {}x", args.speed);

    let controller = SimulationController::new(&scenario, args.speed, args.seed).await?;
    controller.run_scenario(&scenario).await?;

    let metrics = controller.metrics().await;
    let treasury = controller.treasury_metrics();
    let busy = controller.busy_time().await.as_secs_f64();
    info!("Simulation complete");
    info!("Total purchases: {}", metrics.total_purchases);
    info!("Successful: {}", metrics.successful_purchases);
    info!("Refused (insufficient funds): {}", metrics.refused_purchases);
    info!("Failed: {}", metrics.failed_purchases);
    info!("Success rate: {:.2}%", metrics.success_rate() * 100.0);
    info!("Throughput: {:.0}/s", metrics.throughput(busy));
    info!(
        "Latency avg/p50/p99: {}/{}/{}µs",
        metrics.average_latency_us(),
        metrics.p50_latency_us(),
        metrics.p99_latency_us()
    );
    info!(
        "Replenishment checks/orders/rejected/failed: {}/{}/{}/{}",
        treasury.replenish_checks,
        treasury.replenish_orders,
        treasury.replenish_rejected,
        treasury.replenish_failed
    );

    let violations = controller.verify_conservation().await?;
    if !violations.is_empty() {
        for v in &violations {
            error!(
                currency = %v.currency,
                expected = %v.expected,
                actual = %v.actual,
                "Conservation violated"
            );
        }
        anyhow::bail!("{} currencies violate conservation", violations.len());
    }

    info!("Conservation holds for every currency");
    Ok(())
}
