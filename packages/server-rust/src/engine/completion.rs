//! Single-assignment result handles.
//!
//! [`Completion`] is the engine's write side and [`PendingResult`] the
//! caller's awaitable read side. Every settling method consumes the
//! completion, so a handle can be resolved or rejected at most once; a
//! completion dropped without settling surfaces as
//! [`OperationError::Abandoned`] rather than hanging the caller.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use opbatch_core::OperationError;
use tokio::sync::oneshot;

/// Write side of a result handle. Settled exactly once by the executor.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<Result<T, OperationError>>,
}

impl<T> Completion<T> {
    /// Creates a linked completion / pending-result pair.
    #[must_use]
    pub fn new() -> (Self, PendingResult<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, PendingResult { rx })
    }

    /// Settles the handle with a success or failure.
    ///
    /// A caller that stopped waiting is not an error.
    pub fn settle(self, result: Result<T, OperationError>) {
        let _ = self.tx.send(result);
    }

    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: OperationError) {
        self.settle(Err(error));
    }

    /// Returns `true` if the caller dropped its [`PendingResult`].
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Awaitable result of one queued operation.
#[derive(Debug)]
#[must_use = "the operation still runs, but its result is lost unless awaited"]
pub struct PendingResult<T> {
    rx: oneshot::Receiver<Result<T, OperationError>>,
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T, OperationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
