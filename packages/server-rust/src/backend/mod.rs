//! Backend adapters behind the batching engine.
//!
//! Defines [`BackendAdapter`], the seam between the backend-agnostic
//! queueing core and a concrete store. An adapter receives one drained
//! batch of a single kind, groups it for its store's bulk or pipelined
//! protocol, and returns one outcome per entry in the original order. The
//! engine matches outcomes back to result handles by position.
//!
//! Two adapters ship with the crate:
//!
//! - [`CacheAdapter`](cache::CacheAdapter) over a pipelined key-value
//!   [`CacheStore`](cache::CacheStore)
//! - [`DocumentAdapter`](document::DocumentAdapter) over a bulk-write
//!   [`DocumentStore`](document::DocumentStore)

use std::sync::Arc;

use async_trait::async_trait;
use opbatch_core::{BackendError, BatchRequest};

pub mod cache;
pub mod document;

/// One queued operation as seen by an adapter: its target namespace and
/// its typed request. Result handles stay with the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry<R> {
    /// Key prefix (cache store) or collection name (document store).
    pub target: String,
    pub request: R,
}

impl<R> BatchEntry<R> {
    pub fn new(target: impl Into<String>, request: R) -> Self {
        Self {
            target: target.into(),
            request,
        }
    }
}

/// Why a single entry did not succeed.
#[derive(Debug, Clone)]
pub enum CommandFailure {
    /// The entry's own command failed; siblings are unaffected.
    Command(String),
    /// The round trip carrying this entry failed as a whole.
    Backend(Arc<BackendError>),
}

/// Per-entry result returned by [`BackendAdapter::dispatch`].
pub type CommandOutcome<T> = Result<T, CommandFailure>;

/// The kind enum of an adapter's requests.
pub type KindOf<A> = <<A as BackendAdapter>::Request as BatchRequest>::Kind;

/// Groups and dispatches drained batches against one backend.
///
/// Used as `Arc<A>`, shared by every queue's executor.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    type Request: BatchRequest;
    type Reply: Send + 'static;

    /// Backend name used in logs, events and metric labels.
    fn name(&self) -> &'static str;

    /// Executes a batch of entries that all share `kind`.
    ///
    /// Must return exactly one outcome per entry, in entry order. Missing
    /// outcomes are rejected by the engine as
    /// [`OperationError::MissingResult`](opbatch_core::OperationError::MissingResult).
    ///
    /// # Errors
    ///
    /// Returns an error when the round trip failed before any per-entry
    /// result was known; every entry of the batch is then rejected with it.
    async fn dispatch(
        &self,
        kind: KindOf<Self>,
        batch: &[BatchEntry<Self::Request>],
    ) -> Result<Vec<CommandOutcome<Self::Reply>>, BackendError>;

    /// Releases the backend connection. Called once, after the final drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend failed to close cleanly.
    async fn close(&self) -> Result<(), BackendError>;
}
