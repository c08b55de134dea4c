//! Spend tracking and budget-gated admission control.

use crate::config::BudgetConfig;
use crate::models::{TaskKind, UsageReport};

/// Tracks cumulative spend and gates background-class task admission.
///
/// A total limit of zero disables gating entirely: `percent_spent`
/// reports 0 and every kind is admitted.
#[derive(Debug, Clone)]
pub struct BudgetGate {
    total_limit_usd: f64,
    evolution_cutoff_pct: f64,
    background_pct: f64,
    spent_usd: f64,
}

impl BudgetGate {
    /// Build a gate from config, seeding previously-persisted spend.
    #[must_use]
    pub fn new(config: &BudgetConfig, spent_usd: f64) -> Self {
        Self {
            total_limit_usd: config.total_limit_usd,
            evolution_cutoff_pct: config.evolution_cutoff_pct,
            background_pct: config.background_pct,
            spent_usd,
        }
    }

    /// Accumulate spend from one usage report (any source).
    pub fn record_usage(&mut self, usage: &UsageReport) {
        self.spent_usd += usage.cost_usd.max(0.0);
    }

    /// Cumulative spend in USD.
    #[must_use]
    pub fn spent_usd(&self) -> f64 {
        self.spent_usd
    }

    /// Spend as a percentage of the total limit (0 when unlimited).
    #[must_use]
    pub fn percent_spent(&self) -> f64 {
        if self.total_limit_usd <= 0.0 {
            return 0.0;
        }
        self.spent_usd / self.total_limit_usd * 100.0
    }

    /// Whether a task of `kind` may be assigned right now.
    ///
    /// Background-class kinds are refused at or beyond the cutoff;
    /// interactive kinds are never gated by the ceiling.
    #[must_use]
    pub fn admits(&self, kind: TaskKind) -> bool {
        if !kind.is_background_class() {
            return true;
        }
        self.percent_spent() < self.evolution_cutoff_pct
    }

    /// The background mind's sub-allocation in USD (0 when unlimited).
    #[must_use]
    pub fn background_allocation_usd(&self) -> f64 {
        if self.total_limit_usd <= 0.0 {
            return 0.0;
        }
        self.total_limit_usd * (self.background_pct / 100.0)
    }
}
