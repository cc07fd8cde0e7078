//! Document backend: bulk-write store contract and its adapter.
//!
//! [`DocumentAdapter`] groups a drained batch for the store's bulk protocol:
//!
//! - inserts, updates and deletes are grouped by collection, one unordered
//!   bulk write per collection, all collections in flight together;
//! - selects that are a plain single-field equality lookup are grouped by
//!   collection and field into one lookup-in-set query, and the result set
//!   is fanned back out by identifier-tolerant matching;
//! - any other select runs as its own query.
//!
//! Every dispatch first waits, bounded, for the store to report ready.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join, join_all};
use opbatch_core::document::{field_equals, get_path};
use opbatch_core::filter::equality_key;
use opbatch_core::{
    BackendError, Document, DocumentKind, DocumentReply, DocumentRequest, FindOptions, MatchKey,
    Value,
};
use tracing::debug;

use super::{BackendAdapter, BatchEntry, CommandFailure, CommandOutcome};

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use memory::MemoryDocumentStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoDocumentStore;

/// One write of an unordered bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    DeleteMany {
        filter: Document,
    },
}

/// Per-model result of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    Inserted {
        id: Value,
    },
    Updated {
        matched: u64,
        modified: u64,
        upserted_id: Option<Value>,
    },
    Deleted {
        count: u64,
    },
}

impl From<WriteResult> for DocumentReply {
    fn from(result: WriteResult) -> Self {
        match result {
            WriteResult::Inserted { id } => DocumentReply::Inserted { id },
            WriteResult::Updated {
                matched,
                modified,
                upserted_id,
            } => DocumentReply::Updated {
                matched,
                modified,
                upserted_id,
            },
            WriteResult::Deleted { count } => DocumentReply::Deleted { count },
        }
    }
}

/// Outcome of one bulk-write model; `Err` carries the store's message.
pub type ModelResult = Result<WriteResult, String>;

/// A document store with bulk writes and lookup-in-set queries.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Waits until the store can serve requests, for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotReady`] if the store did not become ready
    /// in time.
    async fn wait_ready(&self, timeout: Duration) -> Result<(), BackendError>;

    /// Applies every model in one unordered bulk write, continuing past
    /// individual failures. Returns one result per model, in model order.
    ///
    /// # Errors
    ///
    /// Returns an error if the bulk write could not be sent at all.
    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
    ) -> Result<Vec<ModelResult>, BackendError>;

    /// Runs one query.
    ///
    /// # Errors
    ///
    /// Returns an error if the query failed.
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, BackendError>;

    /// Returns every document whose `field` equals any of `values`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query failed.
    async fn find_in(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Document>, BackendError>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the store failed to close cleanly.
    async fn close(&self) -> Result<(), BackendError>;
}

/// Checks a collection name the way document stores do.
///
/// # Errors
///
/// Returns a message if the name is empty or contains `$` or NUL.
pub fn validate_collection(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("collection name must not be empty".to_string());
    }
    if name.contains('$') || name.contains('\0') {
        return Err(format!("invalid collection name: {name:?}"));
    }
    Ok(())
}

/// [`BackendAdapter`] for [`DocumentRequest`]s. The entry target is the
/// collection name.
pub struct DocumentAdapter {
    store: Arc<dyn DocumentStore>,
    readiness_timeout: Duration,
}

/// Entries of one lookup-in-set query: `(position, key)` pairs plus the
/// distinct values to look up.
#[derive(Default)]
struct LookupGroup<'a> {
    members: Vec<(usize, MatchKey)>,
    values: Vec<&'a Value>,
    seen: HashSet<MatchKey>,
}

fn reject_all(
    outcomes: &mut [Option<CommandOutcome<DocumentReply>>],
    positions: &[usize],
    err: BackendError,
) {
    let err = Arc::new(err);
    for &position in positions {
        outcomes[position] = Some(Err(CommandFailure::Backend(Arc::clone(&err))));
    }
}

impl DocumentAdapter {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, readiness_timeout: Duration) -> Self {
        Self {
            store,
            readiness_timeout,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    async fn dispatch_writes(
        &self,
        batch: &[BatchEntry<DocumentRequest>],
        outcomes: &mut [Option<CommandOutcome<DocumentReply>>],
    ) {
        // Collections in order of first appearance.
        let mut groups: Vec<(&str, Vec<usize>, Vec<WriteModel>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (position, entry) in batch.iter().enumerate() {
            if outcomes[position].is_some() {
                continue;
            }
            let model = match &entry.request {
                DocumentRequest::Insert { document } => WriteModel::InsertOne {
                    document: document.clone(),
                },
                DocumentRequest::Update {
                    filter,
                    update,
                    upsert,
                } => WriteModel::UpdateOne {
                    filter: filter.clone(),
                    update: update.clone(),
                    upsert: *upsert,
                },
                DocumentRequest::Delete { filter } => WriteModel::DeleteMany {
                    filter: filter.clone(),
                },
                DocumentRequest::Select { .. } => {
                    outcomes[position] = Some(Err(CommandFailure::Command(
                        "select routed to a write batch".to_string(),
                    )));
                    continue;
                }
            };
            let slot = *index.entry(entry.target.as_str()).or_insert_with(|| {
                groups.push((entry.target.as_str(), Vec::new(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(position);
            groups[slot].2.push(model);
        }

        let store = &self.store;
        let results = join_all(
            groups
                .into_iter()
                .map(|(collection, positions, models)| async move {
                    debug!(collection, models = models.len(), "bulk write");
                    (positions, store.bulk_write(collection, models).await)
                }),
        )
        .await;

        for (positions, result) in results {
            match result {
                Ok(results) => {
                    let mut results = results.into_iter();
                    for position in positions {
                        outcomes[position] = Some(match results.next() {
                            Some(Ok(written)) => Ok(written.into()),
                            Some(Err(message)) => Err(CommandFailure::Command(message)),
                            None => Err(CommandFailure::Command(
                                "bulk write returned no result".to_string(),
                            )),
                        });
                    }
                }
                Err(err) => reject_all(outcomes, &positions, err),
            }
        }
    }

    async fn dispatch_selects(
        &self,
        batch: &[BatchEntry<DocumentRequest>],
        outcomes: &mut [Option<CommandOutcome<DocumentReply>>],
    ) {
        let mut lookups: HashMap<(&str, &str), LookupGroup<'_>> = HashMap::new();
        let mut singles: Vec<(usize, &str, &Document, &FindOptions)> = Vec::new();

        for (position, entry) in batch.iter().enumerate() {
            if outcomes[position].is_some() {
                continue;
            }
            let DocumentRequest::Select { filter, options } = &entry.request else {
                outcomes[position] = Some(Err(CommandFailure::Command(
                    "write routed to a select batch".to_string(),
                )));
                continue;
            };
            match equality_key(filter).filter(|_| options.is_default()) {
                Some((field, value)) => {
                    let group = lookups.entry((entry.target.as_str(), field)).or_default();
                    let key = MatchKey::of(value);
                    if group.seen.insert(key.clone()) {
                        group.values.push(value);
                    }
                    group.members.push((position, key));
                }
                None => singles.push((position, entry.target.as_str(), filter, options)),
            }
        }

        let store = &self.store;
        let grouped = join_all(lookups.into_iter().map(|((collection, field), group)| async move {
            let values: Vec<Value> = group.values.into_iter().cloned().collect();
            debug!(collection, field, values = values.len(), "lookup-in-set");
            let found = store.find_in(collection, field, &values).await;
            (field, group.members, found)
        }));
        let individual = join_all(singles.into_iter().map(
            |(position, collection, filter, options)| async move {
                (position, store.find(collection, filter, options).await)
            },
        ));
        let (grouped, individual) = join(grouped, individual).await;

        for (field, members, found) in grouped {
            match found {
                Ok(documents) => {
                    for (position, key) in members {
                        let matching = documents
                            .iter()
                            .filter(|doc| {
                                get_path(doc, field).is_some_and(|v| field_equals(v, &key))
                            })
                            .cloned()
                            .collect();
                        outcomes[position] = Some(Ok(DocumentReply::Documents {
                            documents: matching,
                        }));
                    }
                }
                Err(err) => {
                    let positions: Vec<usize> = members.into_iter().map(|(p, _)| p).collect();
                    reject_all(outcomes, &positions, err);
                }
            }
        }
        for (position, found) in individual {
            outcomes[position] = Some(match found {
                Ok(documents) => Ok(DocumentReply::Documents { documents }),
                Err(err) => Err(CommandFailure::Backend(Arc::new(err))),
            });
        }
    }
}

#[async_trait]
impl BackendAdapter for DocumentAdapter {
    type Request = DocumentRequest;
    type Reply = DocumentReply;

    fn name(&self) -> &'static str {
        "document"
    }

    async fn dispatch(
        &self,
        kind: DocumentKind,
        batch: &[BatchEntry<DocumentRequest>],
    ) -> Result<Vec<CommandOutcome<DocumentReply>>, BackendError> {
        self.store.wait_ready(self.readiness_timeout).await?;

        let mut outcomes: Vec<Option<CommandOutcome<DocumentReply>>> = batch
            .iter()
            .map(|entry| {
                validate_collection(&entry.target)
                    .err()
                    .map(|message| Err(CommandFailure::Command(message)))
            })
            .collect();

        match kind {
            DocumentKind::Select => self.dispatch_selects(batch, &mut outcomes).await,
            DocumentKind::Insert | DocumentKind::Update | DocumentKind::Delete => {
                self.dispatch_writes(batch, &mut outcomes).await;
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    Err(CommandFailure::Command("no result for operation".to_string()))
                })
            })
            .collect())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn insert(collection: &str, value: Value) -> BatchEntry<DocumentRequest> {
        BatchEntry::new(
            collection,
            DocumentRequest::Insert {
                document: doc(value),
            },
        )
    }

    fn select(collection: &str, filter: Value) -> BatchEntry<DocumentRequest> {
        BatchEntry::new(
            collection,
            DocumentRequest::Select {
                filter: doc(filter),
                options: FindOptions::default(),
            },
        )
    }

    fn adapter() -> (Arc<MemoryDocumentStore>, DocumentAdapter) {
        let store = Arc::new(MemoryDocumentStore::new());
        let adapter = DocumentAdapter::new(store.clone(), Duration::from_millis(100));
        (store, adapter)
    }

    fn documents(outcome: &CommandOutcome<DocumentReply>) -> &[Document] {
        match outcome {
            Ok(DocumentReply::Documents { documents }) => documents,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collection_names_are_validated() {
        assert!(validate_collection("products").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("a$b").is_err());
        assert!(validate_collection("a\0b").is_err());
    }

    #[tokio::test]
    async fn writes_group_by_collection_in_first_seen_order() {
        let (store, adapter) = adapter();
        let batch = vec![
            insert("a", json!({"n": 1})),
            insert("b", json!({"n": 2})),
            insert("a", json!({"n": 3})),
        ];

        let outcomes = adapter.dispatch(DocumentKind::Insert, &batch).await.unwrap();
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Ok(DocumentReply::Inserted { .. }))));

        let mut writes: Vec<(String, usize)> = store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                memory::StoreCall::BulkWrite { collection, models } => {
                    Some((collection, models.len()))
                }
                _ => None,
            })
            .collect();
        writes.sort();
        assert_eq!(writes, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    }

    #[tokio::test]
    async fn equality_selects_share_one_lookup() {
        let (store, adapter) = adapter();
        adapter
            .dispatch(
                DocumentKind::Insert,
                &[
                    insert("p", json!({"sku": "A", "qty": 1})),
                    insert("p", json!({"sku": "B", "qty": 2})),
                ],
            )
            .await
            .unwrap();

        let batch = vec![
            select("p", json!({"sku": "A"})),
            select("p", json!({"sku": "Z"})),
            select("p", json!({"sku": "B"})),
            select("p", json!({"sku": "A"})),
        ];
        let outcomes = adapter.dispatch(DocumentKind::Select, &batch).await.unwrap();

        assert_eq!(documents(&outcomes[0])[0]["qty"], json!(1));
        assert!(documents(&outcomes[1]).is_empty());
        assert_eq!(documents(&outcomes[2])[0]["qty"], json!(2));
        assert_eq!(documents(&outcomes[3]).len(), 1);

        let lookups: Vec<usize> = store
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                memory::StoreCall::FindIn { values, .. } => Some(values),
                _ => None,
            })
            .collect();
        assert_eq!(lookups, vec![3]);
    }

    #[tokio::test]
    async fn identifier_lookup_matches_native_ids() {
        let (_store, adapter) = adapter();
        let outcomes = adapter
            .dispatch(DocumentKind::Insert, &[insert("p", json!({"name": "x"}))])
            .await
            .unwrap();
        let Ok(DocumentReply::Inserted { id }) = &outcomes[0] else {
            panic!("insert failed");
        };
        let plain = id["$oid"].clone();
        assert!(plain.is_string());

        let found = adapter
            .dispatch(DocumentKind::Select, &[select("p", json!({"_id": plain}))])
            .await
            .unwrap();
        assert_eq!(documents(&found[0])[0]["name"], json!("x"));
    }

    #[tokio::test]
    async fn invalid_collection_fails_only_its_entry() {
        let (_store, adapter) = adapter();
        let batch = vec![
            insert("ok", json!({"n": 1})),
            insert("bad$name", json!({"n": 2})),
            insert("ok", json!({"n": 3})),
        ];
        let outcomes = adapter.dispatch(DocumentKind::Insert, &batch).await.unwrap();
        assert!(outcomes[0].is_ok());
        assert!(matches!(&outcomes[1], Err(CommandFailure::Command(_))));
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn complex_selects_run_individually() {
        let (store, adapter) = adapter();
        adapter
            .dispatch(
                DocumentKind::Insert,
                &[
                    insert("p", json!({"qty": 1})),
                    insert("p", json!({"qty": 5})),
                    insert("p", json!({"qty": 9})),
                ],
            )
            .await
            .unwrap();

        let batch = vec![
            select("p", json!({"qty": {"$gte": 5}})),
            BatchEntry::new(
                "p",
                DocumentRequest::Select {
                    filter: Document::new(),
                    options: FindOptions {
                        limit: Some(1),
                        ..FindOptions::default()
                    },
                },
            ),
        ];
        let outcomes = adapter.dispatch(DocumentKind::Select, &batch).await.unwrap();
        assert_eq!(documents(&outcomes[0]).len(), 2);
        assert_eq!(documents(&outcomes[1]).len(), 1);

        let finds = store
            .calls()
            .into_iter()
            .filter(|call| matches!(call, memory::StoreCall::Find { .. }))
            .count();
        assert_eq!(finds, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unready_store_fails_the_batch() {
        let (store, adapter) = adapter();
        store.set_ready(false);

        let err = adapter
            .dispatch(DocumentKind::Insert, &[insert("p", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotReady { waited_ms: 100 }));
    }
}
