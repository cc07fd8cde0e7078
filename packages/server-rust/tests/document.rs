//! Document-store batching: bulk writes, lookup-in-set reads, readiness.

use std::sync::Arc;
use std::time::Duration;

use opbatch_core::{
    BackendError, Document, DocumentReply, FindOptions, OperationError, SortOrder, Value,
};
use opbatch_server::backend::document::memory::StoreCall;
use opbatch_server::backend::document::{DocumentStore, WriteModel};
use opbatch_server::{
    BatchEngine, DocumentAdapter, DocumentClient, EngineConfig, MemoryDocumentStore,
};
use serde_json::json;

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

struct Harness {
    store: Arc<MemoryDocumentStore>,
    engine: Arc<BatchEngine<DocumentAdapter>>,
    items: DocumentClient,
}

fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let adapter = DocumentAdapter::new(store.clone(), config.readiness_timeout());
    let engine = Arc::new(BatchEngine::start(adapter, config).unwrap());
    let items = DocumentClient::new(Arc::clone(&engine), "items");
    Harness {
        store,
        engine,
        items,
    }
}

fn bulk_writes(store: &MemoryDocumentStore) -> Vec<(String, Vec<WriteModel>)> {
    store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::BulkWrite { collection, models } => Some((collection, models)),
            _ => None,
        })
        .collect()
}

fn documents(reply: DocumentReply) -> Vec<Document> {
    match reply {
        DocumentReply::Documents { documents } => documents,
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn one_slow_tick_sends_one_bulk_write_in_order() {
    let h = harness(EngineConfig::default());

    let pending: Vec<_> = [json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]
        .into_iter()
        .map(|d| h.items.insert(doc(d)).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_millis(55)).await;
    for result in pending {
        assert!(matches!(result.await.unwrap(), DocumentReply::Inserted { .. }));
    }

    let writes = bulk_writes(&h.store);
    assert_eq!(writes.len(), 1);
    let (collection, models) = &writes[0];
    assert_eq!(collection, "items");
    let keys: Vec<&str> = models
        .iter()
        .map(|model| match model {
            WriteModel::InsertOne { document } => document.keys().next().unwrap().as_str(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn lookups_on_one_field_fan_out_with_empty_misses() {
    let h = harness(EngineConfig::default());
    let seeded = h
        .store
        .bulk_write(
            "items",
            ["A", "B", "C"]
                .into_iter()
                .map(|sku| WriteModel::InsertOne {
                    document: doc(json!({"sku": sku, "name": format!("item {sku}")})),
                })
                .collect(),
        )
        .await
        .unwrap();
    assert!(seeded.iter().all(Result::is_ok));

    let pending: Vec<_> = ["A", "X", "B", "Y", "C"]
        .into_iter()
        .map(|sku| h.items.select(doc(json!({"sku": sku}))).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_millis(15)).await;
    let mut results = Vec::new();
    for result in pending {
        results.push(documents(result.await.unwrap()));
    }

    assert_eq!(results[0][0]["name"], json!("item A"));
    assert!(results[1].is_empty());
    assert_eq!(results[2][0]["name"], json!("item B"));
    assert!(results[3].is_empty());
    assert_eq!(results[4][0]["name"], json!("item C"));
    assert!(results.iter().all(|r| r.len() <= 1));

    let lookups: Vec<_> = h
        .store
        .calls()
        .into_iter()
        .filter(|call| matches!(call, StoreCall::FindIn { .. }))
        .collect();
    assert_eq!(
        lookups,
        vec![StoreCall::FindIn {
            collection: "items".to_string(),
            field: "sku".to_string(),
            values: 5,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn selects_by_generated_id_match_native_identifiers() {
    let h = harness(EngineConfig::default());
    let DocumentReply::Inserted { id } = h
        .items
        .insert(doc(json!({"name": "widget"})))
        .unwrap()
        .await
        .unwrap()
    else {
        panic!("insert did not report an id");
    };

    let plain = id["$oid"].clone();
    let by_plain = documents(h.items.select(doc(json!({"_id": plain}))).unwrap().await.unwrap());
    let by_native = documents(h.items.select(doc(json!({"_id": id}))).unwrap().await.unwrap());
    assert_eq!(by_plain.len(), 1);
    assert_eq!(by_plain, by_native);
}

#[tokio::test(start_paused = true)]
async fn null_equality_select_also_matches_missing_fields() {
    let h = harness(EngineConfig::default());
    for d in [
        json!({"n": 1}),
        json!({"n": 2, "deleted_at": null}),
        json!({"n": 3, "deleted_at": "2024-01-01"}),
    ] {
        h.items.insert(doc(d)).unwrap().await.unwrap();
    }

    let live = doc(json!({"deleted_at": null}));
    let direct = h
        .store
        .find("items", &live, &FindOptions::default())
        .await
        .unwrap();
    let pending_live = h.items.select(live).unwrap();
    let pending_gone = h.items.select(doc(json!({"deleted_at": "2024-01-01"}))).unwrap();

    let live = documents(pending_live.await.unwrap());
    assert_eq!(direct.len(), 2);
    assert_eq!(live, direct);
    let gone = documents(pending_gone.await.unwrap());
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0]["n"], json!(3));
}

#[tokio::test(start_paused = true)]
async fn bad_collection_fails_alone() {
    let h = harness(EngineConfig::default());
    let bad = h.items.collection("bad$name");

    let first = h.items.insert(doc(json!({"n": 1}))).unwrap();
    let broken = bad.insert(doc(json!({"n": 2}))).unwrap();
    let last = h.items.insert(doc(json!({"n": 3}))).unwrap();

    assert!(first.await.is_ok());
    let err = broken.await.unwrap_err();
    assert!(err.is_command_failure());
    assert!(err.to_string().contains("invalid collection name"));
    assert!(last.await.is_ok());
    assert_eq!(h.store.documents("items").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn duplicate_key_in_bulk_write_rejects_only_that_insert() {
    let h = harness(EngineConfig::default());

    let first = h.items.insert(doc(json!({"_id": 7, "n": 1}))).unwrap();
    let duplicate = h.items.insert(doc(json!({"_id": 7, "n": 2}))).unwrap();
    let other = h.items.insert(doc(json!({"_id": 8, "n": 3}))).unwrap();

    assert_eq!(
        first.await.unwrap(),
        DocumentReply::Inserted { id: json!(7) }
    );
    assert!(duplicate
        .await
        .unwrap_err()
        .to_string()
        .contains("duplicate key"));
    assert!(other.await.is_ok());
    assert_eq!(bulk_writes(&h.store).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unready_store_rejects_after_the_readiness_timeout() {
    let h = harness(EngineConfig {
        readiness_timeout_ms: 200,
        ..EngineConfig::default()
    });
    h.store.set_ready(false);

    let pending = h.items.insert(doc(json!({"n": 1}))).unwrap();
    match pending.await.unwrap_err() {
        OperationError::Batch(err) => {
            assert!(matches!(*err, BackendError::NotReady { waited_ms: 200 }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(bulk_writes(&h.store).is_empty());

    h.store.set_ready(true);
    let pending = h.items.insert(doc(json!({"n": 1}))).unwrap();
    assert!(pending.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn dispatch_waits_for_a_store_that_becomes_ready() {
    let h = harness(EngineConfig::default());
    h.store.set_ready(false);

    let pending = h.items.insert(doc(json!({"n": 1}))).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.store.set_ready(true);
    assert!(pending.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn updates_and_deletes_run_in_their_own_batches() {
    let h = harness(EngineConfig::default());
    for n in 0..4 {
        h.items
            .insert(doc(json!({"n": n, "group": n % 2})))
            .unwrap()
            .await
            .unwrap();
    }

    let update = h
        .items
        .update(doc(json!({"n": 0})), doc(json!({"$set": {"tag": "first"}})))
        .unwrap();
    let missing = h
        .items
        .update(doc(json!({"n": 99})), doc(json!({"$set": {"tag": "none"}})))
        .unwrap();
    let delete = h.items.delete(doc(json!({"group": 1}))).unwrap();

    assert!(matches!(
        update.await.unwrap(),
        DocumentReply::Updated { matched: 1, modified: 1, upserted_id: None }
    ));
    assert!(matches!(
        missing.await.unwrap(),
        DocumentReply::Updated { matched: 0, .. }
    ));
    assert_eq!(delete.await.unwrap(), DocumentReply::Deleted { count: 2 });
    assert_eq!(h.store.documents("items").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn select_with_options_runs_its_own_query() {
    let h = harness(EngineConfig::default());
    for n in [5, 1, 3] {
        h.items
            .insert(doc(json!({"n": n})))
            .unwrap()
            .await
            .unwrap();
    }

    let options = FindOptions {
        sort: vec![("n".to_string(), SortOrder::Ascending)],
        limit: Some(2),
        ..FindOptions::default()
    };
    let found = documents(
        h.items
            .select_with(Document::new(), options)
            .unwrap()
            .await
            .unwrap(),
    );
    let ns: Vec<&Value> = found.iter().map(|d| &d["n"]).collect();
    assert_eq!(ns, vec![&json!(1), &json!(3)]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_pending_writes_then_closes_the_store() {
    let h = harness(EngineConfig {
        slow_interval_ms: 3_600_000,
        ..EngineConfig::default()
    });
    let pending: Vec<_> = (0..10)
        .map(|n| h.items.insert(doc(json!({"n": n}))).unwrap())
        .collect();

    h.engine.shutdown().await.unwrap();

    for result in pending {
        assert!(result.await.is_ok());
    }
    assert_eq!(h.store.documents("items").len(), 10);
    assert!(h.store.is_closed());
    assert_eq!(bulk_writes(&h.store).len(), 1);
}
