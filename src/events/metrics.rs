//! Event Propagation Metrics
//!
//! Lock-free counters updated on the publish and delivery hot paths, with
//! point-in-time snapshots for the metrics endpoint and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Bus Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for the event bus, aligned to prevent false sharing with the
/// registry stats that workers touch on the same path
#[repr(C, align(64))]
#[derive(Debug)]
pub struct BusMetrics {
    /// Events accepted into the submission queue
    pub published: AtomicU64,
    /// Events refused because the bus was stopped or the queue was full
    pub rejected: AtomicU64,
    /// Individual observer deliveries handed off
    pub delivered: AtomicU64,
    /// Topic matches suppressed by a subscription filter
    pub filtered: AtomicU64,
    /// Deliveries dropped because an observer buffer was full
    pub dropped_full: AtomicU64,
    /// Deliveries dropped because an observer had gone away
    pub dropped_closed: AtomicU64,
    /// Padding to fill cache line
    _padding: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<BusMetrics>() <= CACHE_LINE_SIZE);

impl Default for BusMetrics {
    fn default() -> Self {
        Self {
            published: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_closed: AtomicU64::new(0),
            _padding: [0; 16],
        }
    }
}

impl BusMetrics {
    #[inline]
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one dispatch pass into the counters
    pub fn record_dispatch(&self, report: &DispatchReport) {
        self.delivered.fetch_add(report.delivered, Ordering::Relaxed);
        self.filtered.fetch_add(report.filtered, Ordering::Relaxed);
        self.dropped_full.fetch_add(report.dropped_full, Ordering::Relaxed);
        self.dropped_closed.fetch_add(report.dropped_closed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of bus counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub filtered: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
}

impl BusMetricsSnapshot {
    /// All deliveries that did not reach their observer
    pub fn dropped(&self) -> u64 {
        self.dropped_full + self.dropped_closed
    }
}

/// Outcome of delivering one event to every matching observer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Observers whose patterns matched the topic
    pub matched: u64,
    pub delivered: u64,
    pub filtered: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
}

// =============================================================================
// Registry Statistics
// =============================================================================

/// Subscription registry statistics
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Currently connected observers
    pub observers: AtomicU64,
    /// Currently registered subscriptions across all observers
    pub subscriptions: AtomicU64,
    /// Subscribe operations performed
    pub subscribe_calls: AtomicU64,
    /// Unsubscribe operations performed
    pub unsubscribe_calls: AtomicU64,
    /// Owners removed
    pub removals: AtomicU64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            observers: self.observers.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            subscribe_calls: self.subscribe_calls.load(Ordering::Relaxed),
            unsubscribe_calls: self.unsubscribe_calls.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub observers: u64,
    pub subscriptions: u64,
    pub subscribe_calls: u64,
    pub unsubscribe_calls: u64,
    pub removals: u64,
}
