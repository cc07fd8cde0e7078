//! Per-type queues with their backpressure gate.
//!
//! A [`Lane`] owns the pending records of one operation kind and the
//! sending half of that kind's executor channel. Draining swaps the buffer
//! out and hands it to the executor under the same lock, so:
//!
//! - no record is drained twice or missed,
//! - batches reach the executor in drain order,
//! - a record pushed after [`Lane::close`] is refused instead of stranded.

use std::time::Instant;

use opbatch_core::{BatchRequest, FlushReason, OperationKind};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::completion::Completion;
use crate::backend::{BackendAdapter, BatchEntry, KindOf};

/// One caller request waiting in a queue.
pub(crate) struct OperationRecord<A: BackendAdapter> {
    pub entry: BatchEntry<A::Request>,
    /// Diagnostics only; ordering is FIFO by position.
    pub enqueued_at: Instant,
    pub completion: Completion<A::Reply>,
}

impl<A: BackendAdapter> OperationRecord<A> {
    pub fn new(entry: BatchEntry<A::Request>, completion: Completion<A::Reply>) -> Self {
        Self {
            entry,
            enqueued_at: Instant::now(),
            completion,
        }
    }

    pub fn kind(&self) -> KindOf<A> {
        self.entry.request.kind()
    }
}

/// A drained queue prefix on its way to the executor.
pub(crate) struct Batch<A: BackendAdapter> {
    pub records: Vec<OperationRecord<A>>,
    pub reason: FlushReason,
    /// Fired after the batch (possibly empty) has been fully settled.
    pub barrier: Option<oneshot::Sender<()>>,
}

/// Outcome of pushing a record through the backpressure gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Queued; `depth` records are now waiting.
    Queued { depth: usize },
    /// The push filled the queue, which was flushed immediately.
    Flushed { size: usize },
}

/// The lane no longer accepts records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaneClosed;

struct LaneState<A: BackendAdapter> {
    records: Vec<OperationRecord<A>>,
    sender: Option<mpsc::UnboundedSender<Batch<A>>>,
}

pub(crate) struct Lane<A: BackendAdapter> {
    kind: KindOf<A>,
    max_batch_size: usize,
    state: Mutex<LaneState<A>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<A: BackendAdapter> Lane<A> {
    pub fn new(
        kind: KindOf<A>,
        max_batch_size: usize,
        sender: mpsc::UnboundedSender<Batch<A>>,
    ) -> Self {
        Self {
            kind,
            max_batch_size,
            state: Mutex::new(LaneState {
                records: Vec::new(),
                sender: Some(sender),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> KindOf<A> {
        self.kind
    }

    pub fn depth(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn set_dispatcher(&self, handle: JoinHandle<()>) {
        *self.dispatcher.lock() = Some(handle);
    }

    pub fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.dispatcher.lock().take()
    }

    /// Appends a record, flushing the queue if it reached its ceiling.
    pub fn push(&self, record: OperationRecord<A>) -> Result<Admission, LaneClosed> {
        let mut state = self.state.lock();
        if state.sender.is_none() {
            return Err(LaneClosed);
        }
        state.records.push(record);
        let depth = state.records.len();
        if depth < self.max_batch_size {
            return Ok(Admission::Queued { depth });
        }
        let size = self.drain_locked(&mut state, FlushReason::Backpressure, None);
        Ok(Admission::Flushed { size })
    }

    /// Drains everything queued so far. Returns the number of records drained.
    ///
    /// With a `barrier`, an empty batch is still sent so the barrier fires
    /// once every earlier batch of this lane has settled.
    pub fn flush(&self, reason: FlushReason, barrier: Option<oneshot::Sender<()>>) -> usize {
        let mut state = self.state.lock();
        self.drain_locked(&mut state, reason, barrier)
    }

    /// Final drain: flushes the remainder and stops accepting records.
    ///
    /// Dropping the sender lets the executor exit once it has worked
    /// through the batches already sent.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        let drained = self.drain_locked(&mut state, FlushReason::Shutdown, None);
        state.sender = None;
        drained
    }

    fn drain_locked(
        &self,
        state: &mut LaneState<A>,
        reason: FlushReason,
        barrier: Option<oneshot::Sender<()>>,
    ) -> usize {
        if state.records.is_empty() && barrier.is_none() {
            return 0;
        }
        let Some(sender) = state.sender.as_ref() else {
            // Closed lanes hold no records; dropping the barrier wakes its waiter.
            return 0;
        };
        let records = std::mem::take(&mut state.records);
        let size = records.len();
        if size > 0 {
            debug!(kind = self.kind.as_str(), size, reason = reason.as_str(), "queue drained");
        }
        let batch = Batch {
            records,
            reason,
            barrier,
        };
        if sender.send(batch).is_err() {
            // The executor task is gone; dropping the batch abandons its
            // result handles rather than leaving them pending forever.
            error!(kind = self.kind.as_str(), size, "executor unavailable, batch abandoned");
        }
        size
    }
}
