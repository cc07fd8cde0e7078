//! Typed facades over [`BatchEngine::enqueue`].
//!
//! Each call queues one operation and returns its [`PendingResult`]; awaiting
//! it yields the backend's reply once the operation's batch has run. Clients
//! are cheap to clone and share one engine.

use std::sync::Arc;
use std::time::Duration;

use opbatch_core::{
    CacheReply, CacheRequest, Document, DocumentReply, DocumentRequest, FindOptions,
    OperationError, Value,
};

use crate::backend::cache::CacheAdapter;
use crate::backend::document::DocumentAdapter;
use crate::engine::{BatchEngine, PendingResult};

type Enqueued<T> = Result<PendingResult<T>, OperationError>;

/// Get/set/delete against the cache store under a fixed key prefix.
#[derive(Clone)]
pub struct CacheClient {
    engine: Arc<BatchEngine<CacheAdapter>>,
    prefix: String,
}

impl CacheClient {
    pub fn new(engine: Arc<BatchEngine<CacheAdapter>>, prefix: impl Into<String>) -> Self {
        Self {
            engine,
            prefix: prefix.into(),
        }
    }

    /// Same engine, another prefix.
    #[must_use]
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self::new(Arc::clone(&self.engine), prefix)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn get(&self, key: impl Into<String>) -> Enqueued<CacheReply> {
        self.engine
            .enqueue(self.prefix.as_str(), CacheRequest::Get { key: key.into() })
    }

    /// Stores `value` with no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Enqueued<CacheReply> {
        self.enqueue_set(key.into(), value, None)
    }

    /// Stores `value`, expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Duration,
    ) -> Enqueued<CacheReply> {
        self.enqueue_set(key.into(), value, Some(ttl))
    }

    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn delete(&self, key: impl Into<String>) -> Enqueued<CacheReply> {
        self.engine
            .enqueue(self.prefix.as_str(), CacheRequest::Delete { key: key.into() })
    }

    fn enqueue_set(
        &self,
        key: String,
        value: Value,
        ttl: Option<Duration>,
    ) -> Enqueued<CacheReply> {
        self.engine
            .enqueue(self.prefix.as_str(), CacheRequest::Set { key, value, ttl })
    }
}

/// Insert/update/select/delete against one document collection.
#[derive(Clone)]
pub struct DocumentClient {
    engine: Arc<BatchEngine<DocumentAdapter>>,
    collection: String,
}

impl DocumentClient {
    pub fn new(engine: Arc<BatchEngine<DocumentAdapter>>, collection: impl Into<String>) -> Self {
        Self {
            engine,
            collection: collection.into(),
        }
    }

    /// Same engine, another collection.
    #[must_use]
    pub fn collection(&self, collection: impl Into<String>) -> Self {
        Self::new(Arc::clone(&self.engine), collection)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.collection
    }

    fn enqueue(&self, request: DocumentRequest) -> Enqueued<DocumentReply> {
        self.engine.enqueue(self.collection.as_str(), request)
    }

    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn insert(&self, document: Document) -> Enqueued<DocumentReply> {
        self.enqueue(DocumentRequest::Insert { document })
    }

    /// Updates the first document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn update(&self, filter: Document, update: Document) -> Enqueued<DocumentReply> {
        self.enqueue(DocumentRequest::Update {
            filter,
            update,
            upsert: false,
        })
    }

    /// Updates the first document matching `filter`, inserting one built
    /// from the filter's equality fields if none matches.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn upsert(&self, filter: Document, update: Document) -> Enqueued<DocumentReply> {
        self.enqueue(DocumentRequest::Update {
            filter,
            update,
            upsert: true,
        })
    }

    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn select(&self, filter: Document) -> Enqueued<DocumentReply> {
        self.select_with(filter, FindOptions::default())
    }

    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn select_with(&self, filter: Document, options: FindOptions) -> Enqueued<DocumentReply> {
        self.enqueue(DocumentRequest::Select { filter, options })
    }

    /// Removes every document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::EngineClosed`] once shutdown has begun.
    pub fn delete(&self, filter: Document) -> Enqueued<DocumentReply> {
        self.enqueue(DocumentRequest::Delete { filter })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::cache::MemoryCacheStore;
    use crate::backend::document::MemoryDocumentStore;
    use crate::engine::EngineConfig;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_client_round_trip() {
        let store = Arc::new(MemoryCacheStore::new());
        let engine = Arc::new(
            BatchEngine::start(CacheAdapter::new(store.clone()), EngineConfig::default()).unwrap(),
        );
        let sessions = CacheClient::new(Arc::clone(&engine), "session");

        let stored = sessions.set("u1", json!({"role": "admin"})).unwrap();
        assert_eq!(stored.await.unwrap(), CacheReply::Stored);
        assert!(store.raw("session:u1").is_some());

        let value = sessions.get("u1").unwrap().await.unwrap();
        assert_eq!(
            value,
            CacheReply::Value {
                value: Some(json!({"role": "admin"}))
            }
        );

        let removed = sessions.delete("u1").unwrap().await.unwrap();
        assert_eq!(removed, CacheReply::Deleted { removed: true });

        engine.shutdown().await.unwrap();
        assert!(matches!(sessions.get("u1"), Err(OperationError::EngineClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn document_client_round_trip() {
        let store = Arc::new(MemoryDocumentStore::new());
        let engine = Arc::new(
            BatchEngine::start(
                DocumentAdapter::new(store.clone(), Duration::from_secs(1)),
                EngineConfig::default(),
            )
            .unwrap(),
        );
        let products = DocumentClient::new(Arc::clone(&engine), "products");

        let inserted = products.insert(doc(json!({"sku": "A", "qty": 1}))).unwrap();
        assert!(matches!(inserted.await.unwrap(), DocumentReply::Inserted { .. }));

        let updated = products
            .update(doc(json!({"sku": "A"})), doc(json!({"$inc": {"qty": 4}})))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(updated, DocumentReply::Updated { matched: 1, modified: 1, .. }));

        let upserted = products
            .upsert(doc(json!({"sku": "B"})), doc(json!({"qty": 7})))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(upserted, DocumentReply::Updated { upserted_id: Some(_), .. }));

        let DocumentReply::Documents { documents } =
            products.select(doc(json!({"sku": "A"}))).unwrap().await.unwrap()
        else {
            panic!("expected documents");
        };
        assert_eq!(documents[0]["qty"], json!(5));

        let deleted = products.delete(doc(json!({"sku": "B"}))).unwrap().await.unwrap();
        assert_eq!(deleted, DocumentReply::Deleted { count: 1 });

        engine.shutdown().await.unwrap();
        assert!(store.is_closed());
    }
}
