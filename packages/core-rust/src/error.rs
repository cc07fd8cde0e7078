//! Error types surfaced through per-operation result handles.

use std::sync::Arc;

/// Failure reported by a backend for a whole dispatch round trip.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("backend not ready after {waited_ms}ms")]
    NotReady { waited_ms: u64 },
    #[error("backend connection closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Error delivered to the caller of one queued operation.
///
/// Distinguishes "this operation failed" ([`Command`](Self::Command)) from
/// "the whole batch failed" ([`Batch`](Self::Batch)) so callers can decide
/// whether a retry makes sense. The engine itself never retries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    /// The engine is shutting down or stopped; nothing was queued.
    #[error("engine closed: no further operations are accepted")]
    EngineClosed,
    /// This operation's command failed while its batch siblings went ahead.
    #[error("{kind} command failed: {message}")]
    Command { kind: &'static str, message: String },
    /// The dispatch round trip failed; every operation of the batch shares
    /// the same underlying error.
    #[error("batch dispatch failed: {0}")]
    Batch(Arc<BackendError>),
    /// The backend produced no result for this operation.
    #[error("backend returned no result for this operation")]
    MissingResult,
    /// The result handle was dropped without being settled.
    #[error("operation abandoned before it settled")]
    Abandoned,
}

impl OperationError {
    /// `true` when the failure affected the whole batch, not just this operation.
    #[must_use]
    pub fn is_batch_failure(&self) -> bool {
        matches!(self, OperationError::Batch(_))
    }

    /// `true` when only this operation's command failed.
    #[must_use]
    pub fn is_command_failure(&self) -> bool {
        matches!(self, OperationError::Command { .. })
    }
}
