//! MongoDB [`DocumentStore`] (cargo feature `mongodb`).
//!
//! Each collection's models go out as one unordered client-level
//! `bulkWrite` (MongoDB 8.0 or later) with verbose results, so per-model
//! outcomes and write errors map back by index. Inserts carry pre-assigned
//! object ids. Documents cross the boundary as relaxed extended JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson};
use futures_util::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, PartialBulkWriteResult, WriteError};
use mongodb::options::{
    DeleteManyModel, InsertOneModel, UpdateOneModel, WriteModel as ClientWriteModel,
};
use mongodb::results::VerboseBulkWriteResult;
use mongodb::{Client, Collection, Database, Namespace};
use opbatch_core::{BackendError, Document, FindOptions, SortOrder, Value};
use tracing::{info, warn};

use super::{DocumentStore, ModelResult, WriteModel, WriteResult};

/// Document store backed by a MongoDB database.
pub struct MongoDocumentStore {
    client: Client,
    database: Database,
    ready: AtomicBool,
}

fn to_bson_document(document: Document) -> Result<bson::Document, String> {
    match Bson::try_from(Value::Object(document)).map_err(|e| e.to_string())? {
        Bson::Document(doc) => Ok(doc),
        other => Err(format!("expected a document, got {other:?}")),
    }
}

fn from_bson_document(document: bson::Document) -> Document {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn backend_error(err: &MongoError) -> BackendError {
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => BackendError::Connection(err.to_string()),
        ErrorKind::Shutdown => BackendError::Closed,
        _ => BackendError::Other(err.to_string()),
    }
}

impl MongoDocumentStore {
    /// Creates a client for `uri` and selects `database`.
    ///
    /// Connecting is lazy; readiness is checked on first dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI cannot be parsed.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, BackendError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        let database = client.database(database);
        info!(database = database.name(), "mongodb client created");
        Ok(Self {
            client,
            database,
            ready: AtomicBool::new(false),
        })
    }

    fn collection(&self, name: &str) -> Collection<bson::Document> {
        self.database.collection(name)
    }

    /// Converts one model for the client-level bulk write. Inserts get an
    /// object id up front so the reply can report it.
    fn client_model(
        namespace: &Namespace,
        model: WriteModel,
    ) -> Result<(ClientWriteModel, Option<Value>), String> {
        match model {
            WriteModel::InsertOne { document } => {
                let mut document = to_bson_document(document)?;
                if !document.contains_key("_id") {
                    document.insert("_id", ObjectId::new());
                }
                let id = document
                    .get("_id")
                    .cloned()
                    .map_or(Value::Null, Bson::into_relaxed_extjson);
                let model = InsertOneModel::builder()
                    .namespace(namespace.clone())
                    .document(document)
                    .build();
                Ok((model.into(), Some(id)))
            }
            WriteModel::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let filter = to_bson_document(filter)?;
                let mut update = to_bson_document(update)?;
                if !update.keys().any(|k| k.starts_with('$')) {
                    update = doc! { "$set": update };
                }
                let model = UpdateOneModel::builder()
                    .namespace(namespace.clone())
                    .filter(filter)
                    .update(update)
                    .upsert(upsert)
                    .build();
                Ok((model.into(), None))
            }
            WriteModel::DeleteMany { filter } => {
                let model = DeleteManyModel::builder()
                    .namespace(namespace.clone())
                    .filter(to_bson_document(filter)?)
                    .build();
                Ok((model.into(), None))
            }
        }
    }
}

/// Fills the result of every sent model: its write error if it has one,
/// otherwise whatever the verbose result reports for its index.
fn settle(
    sent: &[(usize, Option<Value>)],
    verbose: Option<&VerboseBulkWriteResult>,
    write_errors: &HashMap<usize, WriteError>,
    results: &mut [Option<ModelResult>],
) {
    for (index, (position, inserted_id)) in sent.iter().enumerate() {
        results[*position] = match write_errors.get(&index) {
            Some(write_error) => Some(Err(write_error.message.clone())),
            None => verbose
                .and_then(|verbose| sent_result(verbose, index, inserted_id.as_ref()))
                .map(Ok),
        };
    }
}

/// Reads the outcome of the `index`-th sent model out of a verbose result.
fn sent_result(
    verbose: &VerboseBulkWriteResult,
    index: usize,
    inserted_id: Option<&Value>,
) -> Option<WriteResult> {
    if let Some(id) = inserted_id {
        return verbose.insert_results.contains_key(&index).then(|| WriteResult::Inserted {
            id: id.clone(),
        });
    }
    if let Some(result) = verbose.update_results.get(&index) {
        return Some(WriteResult::Updated {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.clone().map(Bson::into_relaxed_extjson),
        });
    }
    verbose
        .delete_results
        .get(&index)
        .map(|result| WriteResult::Deleted {
            count: result.deleted_count,
        })
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn wait_ready(&self, timeout: Duration) -> Result<(), BackendError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let ping = self.database.run_command(doc! { "ping": 1 });
        match tokio::time::timeout(timeout, ping).await {
            Ok(Ok(_)) => {
                self.ready.store(true, Ordering::Release);
                info!(database = self.database.name(), "mongodb ready");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(error = %err, "mongodb ping failed");
                Err(backend_error(&err))
            }
            Err(_) => Err(BackendError::NotReady {
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
    ) -> Result<Vec<ModelResult>, BackendError> {
        let namespace = self.collection(collection).namespace();
        let mut results: Vec<Option<ModelResult>> = vec![None; models.len()];

        // `sent[i]` is the caller position and inserted id of the i-th model
        // in the round trip.
        let mut sent = Vec::with_capacity(models.len());
        let mut client_models = Vec::with_capacity(models.len());
        for (position, model) in models.into_iter().enumerate() {
            match Self::client_model(&namespace, model) {
                Ok((model, inserted_id)) => {
                    sent.push((position, inserted_id));
                    client_models.push(model);
                }
                Err(message) => results[position] = Some(Err(message)),
            }
        }

        if !client_models.is_empty() {
            let outcome = self
                .client
                .bulk_write(client_models)
                .ordered(false)
                .verbose_results()
                .await;
            match outcome {
                Ok(verbose) => settle(&sent, Some(&verbose), &HashMap::new(), &mut results),
                Err(err) => match err.kind.as_ref() {
                    ErrorKind::BulkWrite(failure) => {
                        for concern in &failure.write_concern_errors {
                            warn!(collection, error = %concern.message, "write concern error");
                        }
                        let verbose = match &failure.partial_result {
                            Some(PartialBulkWriteResult::Verbose(verbose)) => Some(verbose),
                            _ => None,
                        };
                        settle(&sent, verbose, &failure.write_errors, &mut results);
                    }
                    _ => return Err(backend_error(&err)),
                },
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err("no result reported for write".to_string())))
            .collect())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, BackendError> {
        let filter = to_bson_document(filter.clone()).map_err(BackendError::Protocol)?;
        let mut action = self.collection(collection).find(filter);
        if !options.sort.is_empty() {
            let mut sort = bson::Document::new();
            for (field, order) in &options.sort {
                let direction = match order {
                    SortOrder::Ascending => 1,
                    SortOrder::Descending => -1,
                };
                sort.insert(field.clone(), direction);
            }
            action = action.sort(sort);
        }
        if let Some(projection) = &options.projection {
            let projection =
                to_bson_document(projection.clone()).map_err(BackendError::Protocol)?;
            action = action.projection(projection);
        }
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = options.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let cursor = action.await.map_err(|e| backend_error(&e))?;
        let documents: Vec<bson::Document> =
            cursor.try_collect().await.map_err(|e| backend_error(&e))?;
        Ok(documents.into_iter().map(from_bson_document).collect())
    }

    async fn find_in(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Document>, BackendError> {
        let mut candidates = Vec::with_capacity(values.len());
        for value in values {
            let bson = Bson::try_from(value.clone())
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
            // Plain hex strings on `_id` may name native object ids.
            if field == "_id" {
                if let Some(oid) = value.as_str().and_then(|s| ObjectId::parse_str(s).ok()) {
                    candidates.push(Bson::ObjectId(oid));
                }
            }
            candidates.push(bson);
        }

        let filter = doc! { field: { "$in": candidates } };
        let cursor = self
            .collection(collection)
            .find(filter)
            .await
            .map_err(|e| backend_error(&e))?;
        let documents: Vec<bson::Document> =
            cursor.try_collect().await.map_err(|e| backend_error(&e))?;
        Ok(documents.into_iter().map(from_bson_document).collect())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.client.clone().shutdown().await;
        self.ready.store(false, Ordering::Release);
        info!("mongodb client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mongodb::options::{ClientOptions, ServerAddress, UpdateModifications};
    use serde_json::json;

    use super::*;

    fn doc_of(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn namespace() -> Namespace {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: Some(27017),
            }])
            .build();
        let client = Client::with_options(options).unwrap();
        client.database("app").collection::<bson::Document>("items").namespace()
    }

    #[tokio::test]
    async fn insert_models_carry_a_preassigned_id() {
        let namespace = namespace();
        let (model, id) = MongoDocumentStore::client_model(
            &namespace,
            WriteModel::InsertOne {
                document: doc_of(json!({"sku": "A"})),
            },
        )
        .unwrap();

        let id = id.unwrap();
        assert!(id["$oid"].is_string());
        match model {
            ClientWriteModel::InsertOne(insert) => {
                assert_eq!(insert.namespace, namespace);
                let stored = insert.document.get_object_id("_id").unwrap();
                assert_eq!(Some(stored.to_hex().as_str()), id["$oid"].as_str());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_updates_become_set_and_keep_upsert() {
        let (model, id) = MongoDocumentStore::client_model(
            &namespace(),
            WriteModel::UpdateOne {
                filter: doc_of(json!({"sku": "A"})),
                update: doc_of(json!({"name": "lamp"})),
                upsert: true,
            },
        )
        .unwrap();

        assert!(id.is_none());
        match model {
            ClientWriteModel::UpdateOne(update) => {
                assert_eq!(update.filter, doc! { "sku": "A" });
                assert_eq!(update.upsert, Some(true));
                match update.update {
                    UpdateModifications::Document(body) => {
                        assert_eq!(body, doc! { "$set": { "name": "lamp" } });
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deletes_map_to_delete_many() {
        let (model, _) = MongoDocumentStore::client_model(
            &namespace(),
            WriteModel::DeleteMany {
                filter: doc_of(json!({"group": 1})),
            },
        )
        .unwrap();
        assert!(matches!(model, ClientWriteModel::DeleteMany(_)));
    }
}
