//! opbatch server: time-windowed batching of cache and document store
//! operations.
//!
//! [`BatchEngine`] owns the per-type queues, the two cadence timers, the
//! per-queue executors and the shutdown sequence. Backends plug in through
//! [`BackendAdapter`]; [`CacheAdapter`] and [`DocumentAdapter`] ship with
//! in-memory stores, and a MongoDB store is available behind the `mongodb`
//! feature. [`CacheClient`] and [`DocumentClient`] are the typed call sites.

pub mod backend;
pub mod client;
pub mod engine;
pub mod logging;

pub use backend::cache::{CacheAdapter, CacheStore, MemoryCacheStore};
pub use backend::document::{DocumentAdapter, DocumentStore, MemoryDocumentStore};
pub use backend::{BackendAdapter, BatchEntry, CommandFailure, CommandOutcome};
pub use client::{CacheClient, DocumentClient};
pub use engine::{BatchEngine, ConfigError, EngineConfig, EngineState, PendingResult};
