use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the monitoring loop, resettable from the admin surface
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    pub payments_checked: AtomicU64,
    pub transitions_applied: AtomicU64,
    pub regressions_ignored: AtomicU64,
    pub allocations: AtomicU64,
    pub duplicate_allocations: AtomicU64,
    pub terminal_failures: AtomicU64,
    pub transient_errors: AtomicU64,
    pub retry_ceiling_hits: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub payments_checked: u64,
    pub transitions_applied: u64,
    pub regressions_ignored: u64,
    pub allocations: u64,
    pub duplicate_allocations: u64,
    pub terminal_failures: u64,
    pub transient_errors: u64,
    pub retry_ceiling_hits: u64,
}

impl MonitorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            payments_checked: self.payments_checked.load(Ordering::Relaxed),
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            regressions_ignored: self.regressions_ignored.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            duplicate_allocations: self.duplicate_allocations.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            retry_ceiling_hits: self.retry_ceiling_hits.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.payments_checked.store(0, Ordering::Relaxed);
        self.transitions_applied.store(0, Ordering::Relaxed);
        self.regressions_ignored.store(0, Ordering::Relaxed);
        self.allocations.store(0, Ordering::Relaxed);
        self.duplicate_allocations.store(0, Ordering::Relaxed);
        self.terminal_failures.store(0, Ordering::Relaxed);
        self.transient_errors.store(0, Ordering::Relaxed);
        self.retry_ceiling_hits.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = MonitorMetrics::default();
        metrics.payments_checked.fetch_add(3, Ordering::Relaxed);
        metrics.allocations.fetch_add(1, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.payments_checked, 3);
        assert_eq!(snap.allocations, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().payments_checked, 0);
    }
}
