//! Point-in-time metrics snapshot types.
//!
//! Only running aggregates are kept; there is no time series.

use serde::Serialize;

use crate::kind::Cadence;

/// Aggregates for one operation kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindMetrics {
    pub kind: &'static str,
    pub cadence: Cadence,
    /// Operations accepted since start.
    pub operations: u64,
    /// Operations that went through a dispatch.
    pub processed: u64,
    /// Operations whose result handle was rejected.
    pub failed: u64,
    pub batches: u64,
    /// Records currently waiting in the queue.
    pub queue_depth: usize,
    /// `operations / batches`.
    pub average_batch_size: f64,
    pub average_processing_ms: f64,
    /// `operations` divided by cumulative processing time.
    pub operations_per_second: f64,
}

/// Engine-wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub backend: &'static str,
    /// `false` when collection was disabled in the configuration; counters
    /// then stay at zero and only queue depths are live.
    pub enabled: bool,
    pub uptime_ms: u64,
    pub total_operations: u64,
    pub total_batches: u64,
    pub average_batch_size: f64,
    pub average_processing_ms: f64,
    /// Drains forced by the backpressure gate.
    pub forced_flushes: u64,
    /// Drains triggered by cadence timers that found work.
    pub scheduled_flushes: u64,
    pub kinds: Vec<KindMetrics>,
}

impl MetricsSnapshot {
    /// Aggregates for the kind with the given name.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<&KindMetrics> {
        self.kinds.iter().find(|k| k.kind == name)
    }

    /// Records waiting across all queues.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.kinds.iter().map(|k| k.queue_depth).sum()
    }
}

/// `numerator / denominator`, or `0.0` when the denominator is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
