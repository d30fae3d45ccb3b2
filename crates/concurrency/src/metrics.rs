//! Transaction Core instrumentation counters.
//!
//! Not named by spec.md's C-components directly, but every commit-path
//! crate here otherwise carries the ambient observability stack this
//! codebase uses elsewhere (`tracing`); these counters are its quantitative
//! counterpart, cheap enough to leave on in production and aggregate from
//! process metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters covering one transaction manager's whole lifetime.
///
/// Cheap to share: every [`crate::Transaction`] holds an `Arc` to the same
/// instance as its sibling transactions against the same store.
#[derive(Debug, Default)]
pub struct TransactionMetrics {
    begun: AtomicU64,
    committed: AtomicU64,
    conflicts: AtomicU64,
    rolled_back: AtomicU64,
    retries: AtomicU64,
}

/// A point-in-time snapshot of [`TransactionMetrics`], safe to hand out
/// without holding a reference to the live counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Transactions begun.
    pub begun: u64,
    /// Transactions that reached finalizeCommit.
    pub committed: u64,
    /// Commit attempts that failed optimistic concurrency control.
    pub conflicts: u64,
    /// Transactions that ended via explicit or sweeper-driven rollback.
    pub rolled_back: u64,
    /// Total commit retries taken across all transactions.
    pub retries: u64,
}

impl TransactionMetrics {
    /// A fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter's current value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
