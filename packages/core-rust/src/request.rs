//! Typed operation payloads and replies for both backend variants.
//!
//! A request carries its own kind, so enqueueing cannot mismatch a payload
//! with the queue it lands in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::{Document, Value};
use crate::kind::{CacheKind, DocumentKind, OperationKind};

/// A payload that can be queued for batched execution.
pub trait BatchRequest: Send + Sync + 'static {
    /// The kind enum of the backend this request targets.
    type Kind: OperationKind;

    /// Which per-type queue this request belongs to.
    fn kind(&self) -> Self::Kind;
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

/// Request against the key-value cache store. The target is the key prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum CacheRequest {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Value,
        /// Time-to-live; `None` keeps the entry until deleted.
        #[serde(default, with = "ttl_millis")]
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl CacheRequest {
    /// The key within the target prefix.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            CacheRequest::Get { key }
            | CacheRequest::Set { key, .. }
            | CacheRequest::Delete { key } => key,
        }
    }
}

impl BatchRequest for CacheRequest {
    type Kind = CacheKind;

    fn kind(&self) -> CacheKind {
        match self {
            CacheRequest::Get { .. } => CacheKind::Get,
            CacheRequest::Set { .. } => CacheKind::Set,
            CacheRequest::Delete { .. } => CacheKind::Delete,
        }
    }
}

/// Reply to a [`CacheRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum CacheReply {
    /// Result of a get. `None` when the key is absent or expired.
    Value { value: Option<Value> },
    /// A set was applied.
    Stored,
    /// A delete was applied; `removed` is `false` if the key did not exist.
    Deleted { removed: bool },
}

mod ttl_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Sort direction for [`FindOptions::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Read options for a select.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FindOptions {
    /// Inclusion (`1`) or exclusion (`0`) projection.
    pub projection: Option<Document>,
    /// Sort keys, applied in order.
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl FindOptions {
    /// Returns `true` when no projection, sort, limit or skip is set.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.projection.is_none()
            && self.sort.is_empty()
            && self.limit.is_none()
            && self.skip.is_none()
    }
}

/// Request against the document store. The target is the collection name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DocumentRequest {
    Insert {
        document: Document,
    },
    Update {
        filter: Document,
        /// Operator document (`$set`, `$unset`, `$inc`) or a plain field map,
        /// which is applied as `$set`.
        update: Document,
        upsert: bool,
    },
    Select {
        filter: Document,
        #[serde(default)]
        options: FindOptions,
    },
    /// Removes every document matching the filter.
    Delete {
        filter: Document,
    },
}

impl BatchRequest for DocumentRequest {
    type Kind = DocumentKind;

    fn kind(&self) -> DocumentKind {
        match self {
            DocumentRequest::Insert { .. } => DocumentKind::Insert,
            DocumentRequest::Update { .. } => DocumentKind::Update,
            DocumentRequest::Select { .. } => DocumentKind::Select,
            DocumentRequest::Delete { .. } => DocumentKind::Delete,
        }
    }
}

/// Reply to a [`DocumentRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum DocumentReply {
    Inserted {
        id: Value,
    },
    Updated {
        matched: u64,
        modified: u64,
        upserted_id: Option<Value>,
    },
    /// Documents matching a select. Empty when nothing matched.
    Documents {
        documents: Vec<Document>,
    },
    Deleted {
        count: u64,
    },
}
