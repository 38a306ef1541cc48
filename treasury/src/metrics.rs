//! Metrics collection for purchases and replenishment.

use std::sync::atomic::{AtomicU64, Ordering};

use abanex_common::{AbanexError, StatusCategory};
use serde::Serialize;

/// Treasury metrics.
pub struct Metrics {
    /// Purchases started.
    pub purchases_total: AtomicU64,
    /// Purchases committed.
    pub purchases_succeeded: AtomicU64,
    /// Purchases rejected for insufficient funds.
    pub purchases_insufficient_funds: AtomicU64,
    /// Purchases for unknown currencies.
    pub purchases_not_found: AtomicU64,
    /// Purchases rejected as malformed.
    pub purchases_invalid: AtomicU64,
    /// Purchases failed on the server side.
    pub purchases_failed: AtomicU64,
    /// Purchases in progress.
    pub purchases_active: AtomicU64,
    /// Replenishment checks run.
    pub replenish_checks: AtomicU64,
    /// Buy orders filled.
    pub replenish_orders: AtomicU64,
    /// Buy orders rejected as too small.
    pub replenish_rejected: AtomicU64,
    /// Checks that failed.
    pub replenish_failed: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            purchases_total: AtomicU64::new(0),
            purchases_succeeded: AtomicU64::new(0),
            purchases_insufficient_funds: AtomicU64::new(0),
            purchases_not_found: AtomicU64::new(0),
            purchases_invalid: AtomicU64::new(0),
            purchases_failed: AtomicU64::new(0),
            purchases_active: AtomicU64::new(0),
            replenish_checks: AtomicU64::new(0),
            replenish_orders: AtomicU64::new(0),
            replenish_rejected: AtomicU64::new(0),
            replenish_failed: AtomicU64::new(0),
        }
    }

    /// Record purchase started.
    pub fn purchase_started(&self) {
        self.purchases_total.fetch_add(1, Ordering::Relaxed);
        self.purchases_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record purchase success.
    pub fn purchase_succeeded(&self) {
        self.purchases_succeeded.fetch_add(1, Ordering::Relaxed);
        self.purchases_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record purchase failure, bucketed by status category.
    pub fn purchase_failed(&self, error: &AbanexError) {
        let counter = match error.status() {
            StatusCategory::Forbidden => &self.purchases_insufficient_funds,
            StatusCategory::NotFound => &self.purchases_not_found,
            StatusCategory::BadRequest => &self.purchases_invalid,
            StatusCategory::ServerError => &self.purchases_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.purchases_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record replenishment check.
    pub fn replenish_checked(&self) {
        self.replenish_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record filled buy order.
    pub fn replenish_ordered(&self) {
        self.replenish_orders.fetch_add(1, Ordering::Relaxed);
    }

    /// Record buy order rejected as too small.
    pub fn replenish_rejected(&self) {
        self.replenish_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record failed replenishment check.
    pub fn replenish_failed(&self) {
        self.replenish_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            purchases_total: self.purchases_total.load(Ordering::Relaxed),
            purchases_succeeded: self.purchases_succeeded.load(Ordering::Relaxed),
            purchases_insufficient_funds: self.purchases_insufficient_funds.load(Ordering::Relaxed),
            purchases_not_found: self.purchases_not_found.load(Ordering::Relaxed),
            purchases_invalid: self.purchases_invalid.load(Ordering::Relaxed),
            purchases_failed: self.purchases_failed.load(Ordering::Relaxed),
            purchases_active: self.purchases_active.load(Ordering::Relaxed),
            replenish_checks: self.replenish_checks.load(Ordering::Relaxed),
            replenish_orders: self.replenish_orders.load(Ordering::Relaxed),
            replenish_rejected: self.replenish_rejected.load(Ordering::Relaxed),
            replenish_failed: self.replenish_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub purchases_total: u64,
    pub purchases_succeeded: u64,
    pub purchases_insufficient_funds: u64,
    pub purchases_not_found: u64,
    pub purchases_invalid: u64,
    pub purchases_failed: u64,
    pub purchases_active: u64,
    pub replenish_checks: u64,
    pub replenish_orders: u64,
    pub replenish_rejected: u64,
    pub replenish_failed: u64,
}

impl MetricsSnapshot {
    /// Share of finished purchases that committed, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        let finished = self.purchases_total - self.purchases_active;
        if finished == 0 {
            return 0.0;
        }
        self.purchases_succeeded as f64 / finished as f64
    }
}
