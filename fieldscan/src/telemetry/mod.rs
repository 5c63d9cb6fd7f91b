//! Logging initialisation and scan metrics.
//!
//! Metrics are lock-free atomic counters written by workers and the
//! dispatcher; readers take point-in-time snapshots. Nothing here blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

/// Initialises the global tracing subscriber.
///
/// Respects `RUST_LOG` when set; otherwise uses `default_filter` (e.g.
/// `"info"` or `"fieldscan=debug"`). Safe to call once per process; later
/// calls are ignored.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

/// Aggregate counters for one scanning instance.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    scans_succeeded: AtomicU64,
    scans_empty: AtomicU64,
    scans_failed: AtomicU64,
    targets_skipped: AtomicU64,
    events_dispatched: AtomicU64,
    duplicates_suppressed: AtomicU64,
    deliveries_attempted: AtomicU64,
    deliveries_failed: AtomicU64,
}

impl ScanMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a scan that returned at least one find.
    pub fn scan_succeeded(&self) {
        self.scans_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scan that completed but found nothing.
    pub fn scan_empty(&self) {
        self.scans_empty.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed scan attempt.
    pub fn scan_failed(&self) {
        self.scans_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a target skipped for arriving too late.
    pub fn target_skipped(&self) {
        self.targets_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records events handed to the output dispatcher.
    pub fn events_dispatched(&self, count: u64) {
        self.events_dispatched.fetch_add(count, Ordering::Relaxed);
    }

    /// Records an event suppressed as a duplicate.
    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one webhook delivery attempt.
    pub fn delivery_attempted(&self) {
        self.deliveries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one failed webhook delivery.
    pub fn delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans_succeeded: self.scans_succeeded.load(Ordering::Relaxed),
            scans_empty: self.scans_empty.load(Ordering::Relaxed),
            scans_failed: self.scans_failed.load(Ordering::Relaxed),
            targets_skipped: self.targets_skipped.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            deliveries_attempted: self.deliveries_attempted.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ScanMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Scans that returned at least one find.
    pub scans_succeeded: u64,
    /// Scans that completed but found nothing.
    pub scans_empty: u64,
    /// Failed scan attempts.
    pub scans_failed: u64,
    /// Targets skipped for arriving too late.
    pub targets_skipped: u64,
    /// Events handed to the output dispatcher.
    pub events_dispatched: u64,
    /// Events suppressed as duplicates.
    pub duplicates_suppressed: u64,
    /// Webhook delivery attempts.
    pub deliveries_attempted: u64,
    /// Failed webhook deliveries.
    pub deliveries_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = ScanMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = ScanMetrics::new();
        metrics.scan_succeeded();
        metrics.scan_succeeded();
        metrics.scan_empty();
        metrics.scan_failed();
        metrics.target_skipped();
        metrics.events_dispatched(12);
        metrics.duplicate_suppressed();
        metrics.delivery_attempted();
        metrics.delivery_failed();

        let snap = metrics.snapshot();
        assert_eq!(snap.scans_succeeded, 2);
        assert_eq!(snap.scans_empty, 1);
        assert_eq!(snap.scans_failed, 1);
        assert_eq!(snap.targets_skipped, 1);
        assert_eq!(snap.events_dispatched, 12);
        assert_eq!(snap.duplicates_suppressed, 1);
        assert_eq!(snap.deliveries_attempted, 1);
        assert_eq!(snap.deliveries_failed, 1);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let metrics = ScanMetrics::new();
        let before = metrics.snapshot();
        metrics.scan_succeeded();
        let after = metrics.snapshot();

        assert_eq!(before.scans_succeeded, 0);
        assert_eq!(after.scans_succeeded, 1);
    }
}
