//! Key-value cache backend: pipelined store contract and its adapter.
//!
//! [`CacheAdapter`] turns a drained batch into a single pipeline round trip:
//! sets and deletes become one command each, while every get of the batch
//! is folded into one multi-get over the distinct keys. Values are stored
//! as JSON text and parsed back on read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opbatch_core::{BackendError, CacheKind, CacheReply, CacheRequest, Value};

use super::{BackendAdapter, BatchEntry, CommandFailure, CommandOutcome};

pub mod memory;

pub use memory::MemoryCacheStore;

/// One command of a pipeline round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Get {
        key: String,
    },
    /// Fetches several keys at once; replies with an [`CacheValue::Array`]
    /// holding one element per key, in key order.
    MultiGet {
        keys: Vec<String>,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// Replies with the number of keys removed.
    Delete {
        key: String,
    },
}

/// Reply to a single [`CacheCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Nil,
    Data(String),
    Ok,
    Int(i64),
    Array(Vec<CacheValue>),
}

/// Outcome of one pipelined command; `Err` carries the store's message.
pub type CommandResult = Result<CacheValue, String>;

/// A key-value store reachable through pipelined round trips.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Sends every command in one round trip.
    ///
    /// Returns one result per command, in command order. A failing command
    /// does not affect the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the round trip itself failed.
    async fn pipeline(&self, commands: &[CacheCommand]) -> Result<Vec<CommandResult>, BackendError>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store failed to close cleanly.
    async fn close(&self) -> Result<(), BackendError>;
}

/// [`BackendAdapter`] for [`CacheRequest`]s. The entry target is the key
/// prefix.
pub struct CacheAdapter {
    store: Arc<dyn CacheStore>,
}

impl CacheAdapter {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}

/// Builds the stored key: `prefix:key`, or `key` alone for an empty prefix.
#[must_use]
pub fn full_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

/// Parses a stored value, keeping non-JSON text as a plain string.
fn decode(data: String) -> Value {
    serde_json::from_str(&data).unwrap_or(Value::String(data))
}

fn value_reply(value: CacheValue) -> CommandOutcome<CacheReply> {
    match value {
        CacheValue::Nil => Ok(CacheReply::Value { value: None }),
        CacheValue::Data(data) => Ok(CacheReply::Value {
            value: Some(decode(data)),
        }),
        other => Err(CommandFailure::Command(format!(
            "unexpected reply to get: {other:?}"
        ))),
    }
}

fn write_reply(kind: CacheKind, value: CacheValue) -> CommandOutcome<CacheReply> {
    match (kind, value) {
        (CacheKind::Set, CacheValue::Ok) => Ok(CacheReply::Stored),
        (CacheKind::Delete, CacheValue::Int(n)) => Ok(CacheReply::Deleted { removed: n > 0 }),
        (kind, other) => Err(CommandFailure::Command(format!(
            "unexpected reply to {kind}: {other:?}"
        ))),
    }
}

impl CacheAdapter {
    async fn dispatch_gets(
        &self,
        keys: Vec<Option<String>>,
    ) -> Result<Vec<CommandOutcome<CacheReply>>, BackendError> {
        // Distinct keys, in first-seen order.
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut distinct: Vec<String> = Vec::new();
        for key in keys.iter().flatten() {
            if !positions.contains_key(key.as_str()) {
                positions.insert(key.as_str(), distinct.len());
                distinct.push(key.clone());
            }
        }

        let fetched: Result<Vec<CacheValue>, String> = if distinct.is_empty() {
            Ok(Vec::new())
        } else {
            let results = self
                .store
                .pipeline(&[CacheCommand::MultiGet {
                    keys: distinct.clone(),
                }])
                .await?;
            match results.into_iter().next() {
                Some(Ok(CacheValue::Array(values))) if values.len() == distinct.len() => {
                    Ok(values)
                }
                Some(Ok(other)) => Err(format!("unexpected reply to multi-get: {other:?}")),
                Some(Err(message)) => Err(message),
                None => Err("store returned no reply to multi-get".to_string()),
            }
        };

        Ok(keys
            .iter()
            .map(|key| {
                let Some(key) = key else {
                    return Err(CommandFailure::Command("empty key".to_string()));
                };
                match &fetched {
                    Ok(values) => value_reply(values[positions[key.as_str()]].clone()),
                    Err(message) => Err(CommandFailure::Command(message.clone())),
                }
            })
            .collect())
    }

    async fn dispatch_writes(
        &self,
        kind: CacheKind,
        batch: &[BatchEntry<CacheRequest>],
        keys: Vec<Option<String>>,
    ) -> Result<Vec<CommandOutcome<CacheReply>>, BackendError> {
        let mut commands = Vec::with_capacity(batch.len());
        let mut slots = Vec::with_capacity(batch.len());
        for (entry, key) in batch.iter().zip(keys) {
            let Some(key) = key else {
                slots.push(None);
                continue;
            };
            let command = match &entry.request {
                CacheRequest::Set { value, ttl, .. } => CacheCommand::Set {
                    key,
                    value: value.to_string(),
                    ttl: *ttl,
                },
                CacheRequest::Delete { .. } => CacheCommand::Delete { key },
                CacheRequest::Get { .. } => CacheCommand::Get { key },
            };
            slots.push(Some(commands.len()));
            commands.push(command);
        }

        let replies = if commands.is_empty() {
            Vec::new()
        } else {
            self.store.pipeline(&commands).await?
        };
        let mut results: Vec<Option<CommandResult>> = replies.into_iter().map(Some).collect();

        Ok(slots
            .into_iter()
            .map(|slot| {
                let Some(index) = slot else {
                    return Err(CommandFailure::Command("empty key".to_string()));
                };
                match results.get_mut(index).and_then(Option::take) {
                    Some(Ok(value)) => write_reply(kind, value),
                    Some(Err(message)) => Err(CommandFailure::Command(message)),
                    None => Err(CommandFailure::Command(
                        "store returned no reply".to_string(),
                    )),
                }
            })
            .collect())
    }
}

#[async_trait]
impl BackendAdapter for CacheAdapter {
    type Request = CacheRequest;
    type Reply = CacheReply;

    fn name(&self) -> &'static str {
        "cache"
    }

    async fn dispatch(
        &self,
        kind: CacheKind,
        batch: &[BatchEntry<CacheRequest>],
    ) -> Result<Vec<CommandOutcome<CacheReply>>, BackendError> {
        let keys = batch
            .iter()
            .map(|entry| {
                let key = entry.request.key();
                (!key.is_empty()).then(|| full_key(&entry.target, key))
            })
            .collect();

        match kind {
            CacheKind::Get => self.dispatch_gets(keys).await,
            CacheKind::Set | CacheKind::Delete => self.dispatch_writes(kind, batch, keys).await,
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.store.close().await
    }
}
