//! Abanex Treasury
//!
//! Purchase orchestration on top of the ledger, and the policy that keeps
//! the treasury's debt in each currency below a dollar threshold.
//!
//! # Example
//!
//! ```rust,ignore
//! use abanex_treasury::{PurchaseOrchestrator, TreasuryConfig};
//!
//! let config = TreasuryConfig::from_env()?;
//! let orchestrator = PurchaseOrchestrator::new(config, catalog, ledger, exchange)?;
//!
//! let receipt = orchestrator.execute(user, &btc, dec!(0.5)).await?;
//! ```

pub mod config;
pub mod metrics;
pub mod purchase;
pub mod replenisher;
pub mod worker;

pub use config::{ReplenishConfig, ReplenishMode, SettlementConfig, TreasuryConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use purchase::{
    PurchaseOrchestrator, PurchasePhase, PurchaseReceipt, PurchaseRequest, PurchaseResponse, Quote,
};
pub use replenisher::{ReplenishOutcome, TreasuryReplenisher};
pub use worker::{ReplenishmentQueue, ReplenishmentWorker};
