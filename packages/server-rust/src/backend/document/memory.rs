//! In-memory [`DocumentStore`] for tests, the driver and embedding.
//!
//! Collections are `Vec`s of JSON documents in a [`DashMap`]. Generated
//! `_id`s use the extended-JSON object-id form (`{"$oid": "..."}`) so the
//! adapter's identifier-tolerant matching is exercised exactly as against a
//! real document database.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opbatch_core::document::{field_equals, get_path, is_identifier, remove_path, set_path};
use opbatch_core::filter::{matches, sort_cmp};
use opbatch_core::{BackendError, Document, FindOptions, MatchKey, SortOrder, Value};
use parking_lot::Mutex;
use serde_json::{json, Number};
use tokio::sync::watch;

use super::{validate_collection, DocumentStore, ModelResult, WriteModel, WriteResult};

/// A call received by [`MemoryDocumentStore`], for inspection in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    BulkWrite {
        collection: String,
        models: Vec<WriteModel>,
    },
    Find {
        collection: String,
        filter: Document,
    },
    FindIn {
        collection: String,
        field: String,
        values: usize,
    },
}

pub struct MemoryDocumentStore {
    collections: DashMap<String, Vec<Document>>,
    ready: watch::Sender<bool>,
    calls: Mutex<Vec<StoreCall>>,
    faults: Mutex<VecDeque<BackendError>>,
    latency: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh object id in extended-JSON form.
fn generate_id() -> Value {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    json!({ "$oid": &hex[..24] })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > f64::EPSILON),
        _ => true,
    }
}

fn project(doc: &Document, projection: &Document) -> Document {
    let inclusive = projection
        .iter()
        .any(|(field, flag)| field != "_id" && truthy(flag));
    if !inclusive {
        let mut out = doc.clone();
        for (field, flag) in projection {
            if !truthy(flag) {
                remove_path(&mut out, field);
            }
        }
        return out;
    }

    let mut out = Document::new();
    if projection.get("_id").map_or(true, truthy) {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (field, flag) in projection {
        if field == "_id" || !truthy(flag) {
            continue;
        }
        if let Some(value) = get_path(doc, field) {
            set_path(&mut out, field, value.clone());
        }
    }
    out
}

fn increment(current: Option<&Value>, by: &Value) -> Result<Value, String> {
    let Value::Number(by) = by else {
        return Err("cannot increment with a non-numeric argument".to_string());
    };
    let current = match current {
        None => return Ok(Value::Number(by.clone())),
        Some(Value::Number(n)) => n,
        Some(_) => return Err("cannot apply $inc to a non-numeric field".to_string()),
    };
    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }
    let sum = current.as_f64().unwrap_or(0.0) + by.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| "increment overflowed".to_string())
}

/// Applies `$set`, `$unset` and `$inc`. A document with no operator keys
/// replaces the listed fields as if given under `$set`.
fn apply_update(doc: &mut Document, update: &Document) -> Result<(), String> {
    if !update.keys().any(|k| k.starts_with('$')) {
        for (field, value) in update {
            if field != "_id" && !set_path(doc, field, value.clone()) {
                return Err(format!("cannot create field {field:?}"));
            }
        }
        return Ok(());
    }

    for (op, fields) in update {
        let Some(fields) = fields.as_object() else {
            return Err(format!("{op} requires a document argument"));
        };
        for (field, argument) in fields {
            if field == "_id" {
                return Err("the _id field is immutable".to_string());
            }
            match op.as_str() {
                "$set" => {
                    if !set_path(doc, field, argument.clone()) {
                        return Err(format!("cannot create field {field:?}"));
                    }
                }
                "$unset" => {
                    remove_path(doc, field);
                }
                "$inc" => {
                    let next = increment(get_path(doc, field), argument)?;
                    if !set_path(doc, field, next) {
                        return Err(format!("cannot create field {field:?}"));
                    }
                }
                other => return Err(format!("unknown update operator {other}")),
            }
        }
    }
    Ok(())
}

/// Seed for an upserted document: the filter's plain equality fields.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (field, value) in filter {
        if field.starts_with('$') {
            continue;
        }
        let plain = match value {
            Value::Object(map) => is_identifier(value) || !map.keys().any(|k| k.starts_with('$')),
            _ => true,
        };
        if plain {
            set_path(&mut seed, field, value.clone());
        }
    }
    seed
}

fn same_id(doc: &Document, id: &MatchKey) -> bool {
    doc.get("_id").is_some_and(|existing| MatchKey::of(existing) == *id)
}

fn apply_model(docs: &mut Vec<Document>, model: WriteModel) -> ModelResult {
    match model {
        WriteModel::InsertOne { mut document } => {
            let id = document
                .entry("_id".to_string())
                .or_insert_with(generate_id)
                .clone();
            let key = MatchKey::of(&id);
            if docs.iter().any(|doc| same_id(doc, &key)) {
                return Err(format!("E11000 duplicate key error: _id {id}"));
            }
            docs.push(document);
            Ok(WriteResult::Inserted { id })
        }
        WriteModel::UpdateOne {
            filter,
            update,
            upsert,
        } => {
            if let Some(doc) = docs.iter_mut().find(|doc| matches(doc, &filter)) {
                let mut next = doc.clone();
                apply_update(&mut next, &update)?;
                let modified = u64::from(next != *doc);
                *doc = next;
                return Ok(WriteResult::Updated {
                    matched: 1,
                    modified,
                    upserted_id: None,
                });
            }
            if !upsert {
                return Ok(WriteResult::Updated {
                    matched: 0,
                    modified: 0,
                    upserted_id: None,
                });
            }
            let mut doc = upsert_seed(&filter);
            apply_update(&mut doc, &update)?;
            let id = doc
                .entry("_id".to_string())
                .or_insert_with(generate_id)
                .clone();
            docs.push(doc);
            Ok(WriteResult::Updated {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            })
        }
        WriteModel::DeleteMany { filter } => {
            let before = docs.len();
            docs.retain(|doc| !matches(doc, &filter));
            Ok(WriteResult::Deleted {
                count: (before - docs.len()) as u64,
            })
        }
    }
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        let (ready, _rx) = watch::channel(true);
        Self {
            collections: DashMap::new(),
            ready,
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the store ready or not. Waiters resume as soon as it is ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Fails the next call (bulk write or query) with `error`.
    pub fn fail_next(&self, error: BackendError) {
        self.faults.lock().push_back(error);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Every call received so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// A copy of a collection's documents in insertion order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Common prologue of every call: closed check, latency, log, faults.
    async fn begin(&self, call: StoreCall) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.calls.lock().push(call);
        match self.faults.lock().pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn wait_ready(&self, timeout: Duration) -> Result<(), BackendError> {
        if *self.ready.borrow() {
            return Ok(());
        }
        let mut rx = self.ready.subscribe();
        let became_ready = tokio::time::timeout(timeout, async move {
            rx.wait_for(|ready| *ready).await.is_ok()
        })
        .await;
        match became_ready {
            Ok(true) => Ok(()),
            Ok(false) => Err(BackendError::Closed),
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
        self.begin(StoreCall::BulkWrite {
            collection: collection.to_string(),
            models: models.clone(),
        })
        .await?;

        if let Err(message) = validate_collection(collection) {
            return Ok(models.iter().map(|_| Err(message.clone())).collect());
        }
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        Ok(models
            .into_iter()
            .map(|model| apply_model(&mut docs, model))
            .collect())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, BackendError> {
        self.begin(StoreCall::Find {
            collection: collection.to_string(),
            filter: filter.clone(),
        })
        .await?;
        validate_collection(collection).map_err(BackendError::Protocol)?;

        let mut found: Vec<Document> = self
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| matches(doc, filter)).cloned().collect())
            .unwrap_or_default();

        if !options.sort.is_empty() {
            found.sort_by(|a, b| {
                options
                    .sort
                    .iter()
                    .map(|(field, order)| {
                        let ord = sort_cmp(get_path(a, field), get_path(b, field));
                        match order {
                            SortOrder::Ascending => ord,
                            SortOrder::Descending => ord.reverse(),
                        }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = options
            .limit
            .filter(|&limit| limit > 0)
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));

        Ok(found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| match &options.projection {
                Some(projection) => project(&doc, projection),
                None => doc,
            })
            .collect())
    }

    async fn find_in(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> Result<Vec<Document>, BackendError> {
        self.begin(StoreCall::FindIn {
            collection: collection.to_string(),
            field: field.to_string(),
            values: values.len(),
        })
        .await?;
        validate_collection(collection).map_err(BackendError::Protocol)?;

        let keys: HashSet<MatchKey> = values.iter().map(MatchKey::of).collect();
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| {
                        get_path(doc, field)
                            .is_some_and(|stored| keys.iter().any(|key| field_equals(stored, key)))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
