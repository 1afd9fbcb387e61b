//! Prometheus metrics for the store
//!
//! # Metrics
//!
//! - `ttx_atomic_commits_total` - Atomic writes committed
//! - `ttx_atomic_rollbacks_total` - Atomic writes rolled back
//! - `ttx_lock_conflicts_total` - Lock attempts refused because the token was held
//! - `ttx_locks_cleaned_total` - Locks evicted by cleanup
//! - `ttx_check_discrepancies_total` - Discrepancies reported by reconciliation checks

use prometheus::{IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Atomic writes committed
    pub commits_total: IntCounter,

    /// Atomic writes rolled back
    pub rollbacks_total: IntCounter,

    /// Refused lock attempts
    pub lock_conflicts_total: IntCounter,

    /// Evicted locks
    pub locks_cleaned_total: IntCounter,

    /// Reconciliation discrepancies
    pub check_discrepancies_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commits_total =
            IntCounter::new("ttx_atomic_commits_total", "Atomic writes committed")?;
        registry.register(Box::new(commits_total.clone()))?;

        let rollbacks_total =
            IntCounter::new("ttx_atomic_rollbacks_total", "Atomic writes rolled back")?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let lock_conflicts_total = IntCounter::new(
            "ttx_lock_conflicts_total",
            "Lock attempts refused because the token was held",
        )?;
        registry.register(Box::new(lock_conflicts_total.clone()))?;

        let locks_cleaned_total =
            IntCounter::new("ttx_locks_cleaned_total", "Locks evicted by cleanup")?;
        registry.register(Box::new(locks_cleaned_total.clone()))?;

        let check_discrepancies_total = IntCounter::new(
            "ttx_check_discrepancies_total",
            "Discrepancies reported by reconciliation checks",
        )?;
        registry.register(Box::new(check_discrepancies_total.clone()))?;

        Ok(Self {
            commits_total,
            rollbacks_total,
            lock_conflicts_total,
            locks_cleaned_total,
            check_discrepancies_total,
            registry,
        })
    }
}
