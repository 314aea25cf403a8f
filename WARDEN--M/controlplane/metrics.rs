use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::commands::ActionStatus;

/// Number of commands between snapshot log lines.
pub const REPORT_EVERY: u64 = 10;

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Commands that reached a terminal result.
    pub processed: u64,
    /// `SUCCESS` and `SUCCESS_CACHED` results.
    pub success: u64,
    /// `FAILED` results.
    pub failed: u64,
    /// `BLOCKED` results.
    pub blocked: u64,
    /// `NEEDS_APPROVAL` results.
    pub needs_approval: u64,
    /// Duplicates answered from the idempotency cache.
    pub duplicate: u64,
    /// Total latency in milliseconds.
    pub latency_sum_ms: u64,
    /// Number of latency samples.
    pub latency_count: u64,
}

impl MetricsSnapshot {
    /// Mean latency in milliseconds, zero when nothing was measured.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_count == 0 {
            0.0
        } else {
            self.latency_sum_ms as f64 / self.latency_count as f64
        }
    }
}

/// Per-process pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl PipelineMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one terminal result. Returns `true` when a snapshot is due.
    pub fn record(&self, status: ActionStatus, duplicate: bool, latency: Duration) -> bool {
        let mut inner = self.inner.lock();
        inner.processed += 1;
        match status {
            ActionStatus::Success | ActionStatus::SuccessCached => inner.success += 1,
            ActionStatus::Failed => inner.failed += 1,
            ActionStatus::Blocked => inner.blocked += 1,
            ActionStatus::NeedsApproval => inner.needs_approval += 1,
        }
        if duplicate {
            inner.duplicate += 1;
        }
        inner.latency_sum_ms += u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        inner.latency_count += 1;
        inner.processed % REPORT_EVERY == 0
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_status_and_reports_every_ten() {
        let metrics = PipelineMetrics::new();
        let mut due = 0;
        for i in 0..20_u64 {
            let status = if i % 4 == 0 {
                ActionStatus::Failed
            } else {
                ActionStatus::Success
            };
            if metrics.record(status, i == 1, Duration::from_millis(10)) {
                due += 1;
            }
        }
        let snapshot = metrics.snapshot();
        assert_eq!(due, 2);
        assert_eq!(snapshot.processed, 20);
        assert_eq!(snapshot.failed, 5);
        assert_eq!(snapshot.success, 15);
        assert_eq!(snapshot.duplicate, 1);
        assert!((snapshot.avg_latency_ms() - 10.0).abs() < f64::EPSILON);
    }
}
