//! opbatch core: operation kinds, typed requests and replies, the document
//! model with identifier-tolerant matching, and the event and metrics types
//! shared by the batching engine and its callers.

pub mod document;
pub mod error;
pub mod event;
pub mod filter;
pub mod kind;
pub mod metrics;
pub mod request;

pub use document::{Document, MatchKey, Value};
pub use error::{BackendError, OperationError};
pub use event::{EngineEvent, FlushReason};
pub use kind::{Cadence, CacheKind, DocumentKind, OperationKind};
pub use metrics::{KindMetrics, MetricsSnapshot};
pub use request::{
    BatchRequest, CacheReply, CacheRequest, DocumentReply, DocumentRequest, FindOptions, SortOrder,
};
