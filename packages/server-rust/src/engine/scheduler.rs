//! Cadence timers that drain queues on a schedule.
//!
//! One [`CadenceTimer`] runs per cadence class. Its task is the only
//! scheduled drain owner of that class's queues: ticks and explicit flush
//! requests are served by the same `select!` loop, so they never
//! interleave. The two timers share nothing but the lanes and the metrics
//! registry.

use std::sync::Arc;
use std::time::Duration;

use opbatch_core::{Cadence, FlushReason, OperationError, OperationKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::lane::Lane;
use super::metrics::MetricsRegistry;
use crate::backend::{BackendAdapter, KindOf};

/// Barriers handed back for an explicit flush, one per drained queue.
/// Each fires once everything queued before the request has settled.
pub(crate) type Barriers = Vec<oneshot::Receiver<()>>;

struct FlushRequest {
    reply: oneshot::Sender<Barriers>,
}

/// Handle to a running cadence task.
pub(crate) struct CadenceTimer {
    cadence: Cadence,
    requests: Option<mpsc::Sender<FlushRequest>>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CadenceTimer {
    /// Spawns the task draining `cadence`'s queues every `period`.
    ///
    /// The first tick fires one full period after start.
    pub fn start<A: BackendAdapter>(
        cadence: Cadence,
        period: Duration,
        lanes: Arc<[Lane<A>]>,
        metrics: Arc<MetricsRegistry<KindOf<A>>>,
    ) -> Self {
        let (requests, requests_rx) = mpsc::channel(16);
        let (stop, stop_rx) = oneshot::channel();
        let drain = CadenceDrain {
            cadence,
            lanes,
            metrics,
        };
        let handle = tokio::spawn(drain.run(period, requests_rx, stop_rx));
        Self {
            cadence,
            requests: Some(requests),
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Asks the task to drain its queues now. The returned receiver yields
    /// the barriers once the drain has happened.
    pub async fn request_flush(&self) -> Result<oneshot::Receiver<Barriers>, OperationError> {
        let requests = self.requests.as_ref().ok_or(OperationError::EngineClosed)?;
        let (reply, rx) = oneshot::channel();
        requests
            .send(FlushRequest { reply })
            .await
            .map_err(|_| OperationError::EngineClosed)?;
        Ok(rx)
    }

    /// Stops the task. A drain already under way completes first; no tick
    /// starts after this returns.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

struct CadenceDrain<A: BackendAdapter> {
    cadence: Cadence,
    lanes: Arc<[Lane<A>]>,
    metrics: Arc<MetricsRegistry<KindOf<A>>>,
}

impl<A: BackendAdapter> CadenceDrain<A> {
    fn own_lanes(&self) -> impl Iterator<Item = &Lane<A>> {
        let cadence = self.cadence;
        self.lanes
            .iter()
            .filter(move |lane| lane.kind().cadence() == cadence)
    }

    fn on_tick(&self) {
        trace!(cadence = self.cadence.as_str(), "tick");
        for lane in self.own_lanes() {
            if lane.flush(FlushReason::Scheduled, None) > 0 {
                self.metrics.record_flush(FlushReason::Scheduled);
            }
        }
    }

    fn on_request(&self, request: FlushRequest) {
        let barriers = self
            .own_lanes()
            .map(|lane| {
                let (tx, rx) = oneshot::channel();
                lane.flush(FlushReason::Explicit, Some(tx));
                rx
            })
            .collect();
        let _ = request.reply.send(barriers);
    }

    async fn run(
        self,
        period: Duration,
        mut requests: mpsc::Receiver<FlushRequest>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!(cadence = self.cadence.as_str(), "cadence timer stopped");
    }
}
