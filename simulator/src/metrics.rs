//! Simulation metrics.

use std::collections::VecDeque;

use abanex_common::{AbanexError, StatusCategory};

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Purchases attempted.
    pub total_purchases: u64,
    /// Purchases committed.
    pub successful_purchases: u64,
    /// Purchases refused for insufficient funds.
    pub refused_purchases: u64,
    /// Purchases that failed for any other reason.
    pub failed_purchases: u64,
    /// Latency samples (µs).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_purchases: 0,
            successful_purchases: 0,
            refused_purchases: 0,
            failed_purchases: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed purchase.
    pub fn record_success(&mut self, latency_us: u64) {
        self.total_purchases += 1;
        self.successful_purchases += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a failed purchase.
    pub fn record_failure(&mut self, error: &AbanexError) {
        self.total_purchases += 1;
        match error.status() {
            StatusCategory::Forbidden => self.refused_purchases += 1,
            _ => self.failed_purchases += 1,
        }
    }

    /// Fold another set of metrics into this one.
    pub fn merge(&mut self, other: &SimulationMetrics) {
        self.total_purchases += other.total_purchases;
        self.successful_purchases += other.successful_purchases;
        self.refused_purchases += other.refused_purchases;
        self.failed_purchases += other.failed_purchases;
        for sample in &other.latency_samples {
            if self.latency_samples.len() >= self.max_samples {
                self.latency_samples.pop_front();
            }
            self.latency_samples.push_back(*sample);
        }
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_purchases == 0 {
            return 0.0;
        }

        self.successful_purchases as f64 / self.total_purchases as f64
    }

    /// Get throughput (purchases per second).
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }

        self.total_purchases as f64 / duration_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
