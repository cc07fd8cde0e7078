//! Batched operation-queue engine.
//!
//! [`BatchEngine`] coalesces individual operations into time-windowed
//! batches executed against a [`BackendAdapter`]:
//!
//! 1. **Enqueue** (`enqueue`): the request is appended to its kind's queue
//!    and the caller gets a [`PendingResult`] back immediately
//! 2. **Backpressure** (`lane`): a queue reaching its ceiling is flushed
//!    on the spot, without waiting for a tick
//! 3. **Scheduling** (`scheduler`): a fast timer drains read queues, a slow
//!    timer drains write and delete queues, and both serve explicit flushes
//! 4. **Execution** (`executor`): one task per queue dispatches batches in
//!    order and settles every result handle
//! 5. **Shutdown** (`shutdown`): timers stop, every queue is drained one
//!    last time, then the backend connection is released

pub mod completion;
pub mod config;
mod executor;
mod lane;
pub mod metrics;
mod scheduler;
pub mod state;

use std::sync::Arc;

use opbatch_core::{
    BackendError, Cadence, EngineEvent, FlushReason, MetricsSnapshot, OperationError,
    OperationKind,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub use completion::{Completion, PendingResult};
pub use config::{ConfigError, EngineConfig};
pub use metrics::MetricsRegistry;
pub use state::EngineState;

use executor::Executor;
use lane::{Admission, Lane, OperationRecord};
use scheduler::CadenceTimer;
use state::Lifecycle;

use crate::backend::{BackendAdapter, BatchEntry, KindOf};

/// Time-windowed batching engine in front of one backend.
///
/// Construct with [`start`](Self::start) inside a tokio runtime; the cadence
/// timers run immediately. Call [`shutdown`](Self::shutdown) before the
/// process exits: it is the only way to guarantee queued operations reach
/// the backend. Dropping a running engine abandons whatever is still queued.
pub struct BatchEngine<A: BackendAdapter> {
    config: EngineConfig,
    adapter: Arc<A>,
    lanes: Arc<[Lane<A>]>,
    metrics: Arc<MetricsRegistry<KindOf<A>>>,
    events: broadcast::Sender<EngineEvent>,
    lifecycle: Lifecycle,
    timers: Mutex<Vec<CadenceTimer>>,
}

impl<A: BackendAdapter> BatchEngine<A> {
    /// Validates `config`, spawns one executor per operation kind and starts
    /// both cadence timers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(adapter: A, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let adapter = Arc::new(adapter);
        let backend = adapter.name();
        let metrics = Arc::new(MetricsRegistry::new(backend, config.metrics_enabled));
        let (events, _rx) = broadcast::channel(config.event_channel_capacity);
        let executor = Arc::new(Executor::new(
            Arc::clone(&adapter),
            Arc::clone(&metrics),
            events.clone(),
        ));

        let lanes: Arc<[Lane<A>]> = <KindOf<A> as OperationKind>::all()
            .iter()
            .map(|&kind| {
                let (tx, rx) = mpsc::unbounded_channel();
                let lane = Lane::new(kind, config.max_batch_size(kind.cadence()), tx);
                lane.set_dispatcher(tokio::spawn(Arc::clone(&executor).run_lane(kind, rx)));
                lane
            })
            .collect();

        let timers = Cadence::ALL
            .into_iter()
            .filter(|&cadence| lanes.iter().any(|lane| lane.kind().cadence() == cadence))
            .map(|cadence| {
                CadenceTimer::start(
                    cadence,
                    config.interval(cadence),
                    Arc::clone(&lanes),
                    Arc::clone(&metrics),
                )
            })
            .collect();

        info!(
            backend,
            fast_interval_ms = config.fast_interval_ms,
            slow_interval_ms = config.slow_interval_ms,
            max_read_batch_size = config.max_read_batch_size,
            max_write_batch_size = config.max_write_batch_size,
            "batch engine started"
        );

        Ok(Self {
            config,
            adapter,
            lanes,
            metrics,
            events,
            lifecycle: Lifecycle::new(),
            timers: Mutex::new(timers),
        })
    }

    /// Queues one operation against `target`.
    ///
    /// Returns immediately; the operation runs with the next batch of its
    /// kind. If the queue reaches its ceiling, this call flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun. No
    /// record is created in that case.
    pub fn enqueue(
        &self,
        target: impl Into<String>,
        request: A::Request,
    ) -> Result<PendingResult<A::Reply>, OperationError> {
        if !self.lifecycle.is_running() {
            return Err(OperationError::EngineClosed);
        }

        let (completion, pending) = Completion::new();
        let record = OperationRecord::<A>::new(BatchEntry::new(target, request), completion);
        let kind = record.kind();

        // Counted first: a backpressure push may run the batch right away.
        self.metrics.record_enqueue(kind);
        match self.lanes[kind.index()].push(record) {
            Ok(Admission::Queued { .. }) => {}
            Ok(Admission::Flushed { size }) => {
                debug!(
                    backend = self.adapter.name(),
                    kind = kind.as_str(),
                    size,
                    "backpressure flush"
                );
                self.metrics.record_flush(FlushReason::Backpressure);
            }
            Err(_) => return Err(OperationError::EngineClosed),
        }
        Ok(pending)
    }

    /// Drains every queue now and waits until everything queued before the
    /// call has settled. Timers keep running.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub async fn flush(&self) -> Result<(), OperationError> {
        if !self.lifecycle.is_running() {
            return Err(OperationError::EngineClosed);
        }

        let mut replies = Vec::new();
        {
            let timers = self.timers.lock().await;
            if timers.is_empty() {
                return Err(OperationError::EngineClosed);
            }
            for timer in timers.iter() {
                replies.push(timer.request_flush().await?);
            }
        }

        for reply in replies {
            let barriers = reply.await.map_err(|_| OperationError::EngineClosed)?;
            for barrier in barriers {
                // A dropped barrier means the lane closed; shutdown settles it.
                let _ = barrier.await;
            }
        }
        Ok(())
    }

    /// Stops both timers, drains every non-empty queue one final time,
    /// waits for all batches to settle, then closes the backend.
    ///
    /// Safe to call more than once: later calls wait for the first to finish
    /// and return `Ok(())` without draining again.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if closing the connection failed. Every
    /// queued operation has been settled regardless.
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        let backend = self.adapter.name();
        if !self.lifecycle.begin_shutdown() {
            self.lifecycle.wait_stopped().await;
            return Ok(());
        }
        info!(backend, "shutting down batch engine");

        let mut timers = std::mem::take(&mut *self.timers.lock().await);
        for timer in &mut timers {
            debug!(backend, cadence = timer.cadence().as_str(), "stopping cadence timer");
            timer.stop().await;
        }

        let drained: usize = self.lanes.iter().map(Lane::close).sum();

        for lane in self.lanes.iter() {
            if let Some(handle) = lane.take_dispatcher() {
                if let Err(err) = handle.await {
                    error!(
                        backend,
                        kind = lane.kind().as_str(),
                        error = %err,
                        "executor task failed"
                    );
                }
            }
        }

        let result = self.adapter.close().await;
        if let Err(err) = &result {
            error!(backend, error = %err, "backend close failed");
        }

        self.lifecycle.mark_stopped();
        info!(backend, drained, "batch engine stopped");
        result
    }

    /// Current counters plus live queue depths.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(|kind| self.lanes[kind.index()].depth())
    }

    /// Subscribes to batch and backend-failure events.
    ///
    /// Receivers that fall more than the configured capacity behind lose
    /// the oldest events; the engine never waits for them.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The backend adapter this engine dispatches to.
    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: BackendAdapter> Drop for BatchEngine<A> {
    fn drop(&mut self) {
        if self.lifecycle.is_running() {
            let queued: usize = self.lanes.iter().map(Lane::depth).sum();
            warn!(
                backend = self.adapter.name(),
                queued, "batch engine dropped without shutdown"
            );
        }
    }
}
