//! Running counters for the engine and their snapshot.
//!
//! Counters are lock-free atomics updated on every enqueue and after every
//! batch. When collection is enabled each update is also mirrored into the
//! `metrics` facade, so an embedding application can attach any exporter.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use opbatch_core::metrics::ratio;
use opbatch_core::{FlushReason, KindMetrics, MetricsSnapshot, OperationKind};

#[derive(Debug, Default)]
struct KindCounters {
    operations: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    processing_us: AtomicU64,
}

/// Per-kind and engine-wide aggregates for one backend.
#[derive(Debug)]
pub struct MetricsRegistry<K: OperationKind> {
    backend: &'static str,
    enabled: bool,
    started: Instant,
    kinds: Vec<KindCounters>,
    forced_flushes: AtomicU64,
    scheduled_flushes: AtomicU64,
    _kind: PhantomData<fn() -> K>,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl<K: OperationKind> MetricsRegistry<K> {
    #[must_use]
    pub fn new(backend: &'static str, enabled: bool) -> Self {
        Self {
            backend,
            enabled,
            started: Instant::now(),
            kinds: K::all().iter().map(|_| KindCounters::default()).collect(),
            forced_flushes: AtomicU64::new(0),
            scheduled_flushes: AtomicU64::new(0),
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Counts one accepted operation.
    pub fn record_enqueue(&self, kind: K) {
        if !self.enabled {
            return;
        }
        self.kinds[kind.index()]
            .operations
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "opbatch_operations_total",
            "backend" => self.backend,
            "kind" => kind.as_str()
        )
        .increment(1);
    }

    /// Counts a drain. Only timer and backpressure drains are tracked.
    pub fn record_flush(&self, reason: FlushReason) {
        if !self.enabled {
            return;
        }
        let counter = match reason {
            FlushReason::Backpressure => &self.forced_flushes,
            FlushReason::Scheduled => &self.scheduled_flushes,
            FlushReason::Explicit | FlushReason::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "opbatch_flushes_total",
            "backend" => self.backend,
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    /// Folds one processed batch into the aggregates.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_batch(&self, kind: K, size: usize, failed: usize, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let counters = &self.kinds[kind.index()];
        let size = size as u64;
        let failed = failed as u64;
        counters.batches.fetch_add(1, Ordering::Relaxed);
        counters.processed.fetch_add(size, Ordering::Release);
        counters.failed.fetch_add(failed, Ordering::Relaxed);
        counters
            .processing_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);

        let labels = [("backend", self.backend), ("kind", kind.as_str())];
        metrics::counter!("opbatch_batches_total", &labels).increment(1);
        metrics::counter!("opbatch_failed_operations_total", &labels).increment(failed);
        metrics::histogram!("opbatch_batch_size", &labels).record(size as f64);
        metrics::histogram!("opbatch_batch_duration_seconds", &labels)
            .record(elapsed.as_secs_f64());
    }

    /// Builds a snapshot; `depth` reports the live queue length per kind.
    #[must_use]
    pub fn snapshot(&self, depth: impl Fn(K) -> usize) -> MetricsSnapshot {
        let mut total_operations = 0;
        let mut total_batches = 0;
        let mut total_us = 0;

        let kinds = K::all()
            .iter()
            .map(|&kind| {
                let counters = &self.kinds[kind.index()];
                // Read before `operations` so a snapshot never shows more
                // processed than accepted.
                let processed = counters.processed.load(Ordering::Acquire);
                let operations = counters.operations.load(Ordering::Relaxed);
                let batches = counters.batches.load(Ordering::Relaxed);
                let processing_us = counters.processing_us.load(Ordering::Relaxed);
                total_operations += operations;
                total_batches += batches;
                total_us += processing_us;

                KindMetrics {
                    kind: kind.as_str(),
                    cadence: kind.cadence(),
                    operations,
                    processed,
                    failed: counters.failed.load(Ordering::Relaxed),
                    batches,
                    queue_depth: depth(kind),
                    average_batch_size: ratio(operations, batches),
                    average_processing_ms: ratio(processing_us, batches) / 1_000.0,
                    operations_per_second: ratio(operations, processing_us) * 1_000_000.0,
                }
            })
            .collect();

        MetricsSnapshot {
            backend: self.backend,
            enabled: self.enabled,
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            total_operations,
            total_batches,
            average_batch_size: ratio(total_operations, total_batches),
            average_processing_ms: ratio(total_us, total_batches) / 1_000.0,
            forced_flushes: self.forced_flushes.load(Ordering::Relaxed),
            scheduled_flushes: self.scheduled_flushes.load(Ordering::Relaxed),
            kinds,
        }
    }
}
