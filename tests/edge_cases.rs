//! Edge case tests for `ripple_engine`.
//!
//! These cover boundary conditions and unusual inputs against the public
//! Model Store / Queryset Store surface.

use async_trait::async_trait;
use ripple_engine::config::ModelStoreConfig;
use ripple_engine::fetch::{FetchError, GroundTruthFetcher, QuerySetFetcher};
use ripple_engine::operation::OperationType;
use ripple_engine::store_model::ModelStore;
use ripple_engine::store_queryset::QuerySetStore;
use serde_json::{json, Value};
use std::sync::Arc;

struct FixedRecords(Vec<Value>);

#[async_trait]
impl GroundTruthFetcher for FixedRecords {
    async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError> {
        Ok(self.0.clone())
    }
}

struct FixedIds(Vec<Value>);

#[async_trait]
impl QuerySetFetcher for FixedIds {
    async fn fetch_query_set(&self) -> Result<Vec<Value>, FetchError> {
        Ok(self.0.clone())
    }
}

fn model_store(ground_truth: Vec<Value>) -> Arc<ModelStore> {
    ModelStore::new("items", ModelStoreConfig::new("id"), Arc::new(FixedRecords(ground_truth)), None)
}

// ============================================================================
// String edge cases
// ============================================================================

#[tokio::test]
async fn empty_string_field_survives_projection() {
    let store = model_store(vec![]);
    store.add(OperationType::Create, vec![json!({"id": 1, "name": ""})]).await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected[0]["name"], "");
}

#[tokio::test]
async fn unicode_payloads_round_trip_through_projection() {
    let store = model_store(vec![]);
    let samples = vec!["日本語テスト", "Привет мир", "مرحبا بالعالم", "🎉🚀💯", "Ω≈ç√∫", "Hello\nWorld\tTab"];

    for (i, name) in samples.iter().enumerate() {
        store.add(OperationType::Create, vec![json!({"id": i, "name": name})]).await;
    }

    let (_, projected) = store.full_projection().await;
    assert_eq!(projected.len(), samples.len());
    for (i, name) in samples.iter().enumerate() {
        let record = projected.iter().find(|r| r["id"] == i).unwrap();
        assert_eq!(record["name"], *name);
    }
}

#[tokio::test]
async fn very_long_string_field() {
    let store = model_store(vec![]);
    let long_string = "x".repeat(1024 * 1024);
    store.add(OperationType::Create, vec![json!({"id": 1, "name": long_string.clone()})]).await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected[0]["name"].as_str().unwrap().len(), 1024 * 1024);
}

// ============================================================================
// Numeric edge cases
// ============================================================================

#[tokio::test]
async fn integer_boundary_values_survive_projection() {
    let store = model_store(vec![]);
    let values = vec![i64::MIN, i64::MAX, 0i64, -1i64, 1i64];
    for (i, value) in values.iter().enumerate() {
        store.add(OperationType::Create, vec![json!({"id": i, "count": value})]).await;
    }
    let (_, projected) = store.full_projection().await;
    for (i, value) in values.iter().enumerate() {
        let record = projected.iter().find(|r| r["id"] == i).unwrap();
        assert_eq!(record["count"], *value);
    }
}

// ============================================================================
// JSON shape edge cases
// ============================================================================

#[tokio::test]
async fn deeply_nested_json_payload() {
    let store = model_store(vec![]);
    let mut nested = json!({"value": "leaf"});
    for _ in 0..50 {
        nested = json!({"nested": nested});
    }
    store.add(OperationType::Create, vec![json!({"id": 1, "data": nested.clone()})]).await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected[0]["data"], nested);
}

#[tokio::test]
async fn json_with_all_value_kinds() {
    let store = model_store(vec![]);
    let complex = json!({
        "string": "hello",
        "number": 42,
        "float": 3.14159,
        "bool_true": true,
        "bool_false": false,
        "null": null,
        "array": [1, 2, 3, "mixed", true, null],
        "object": {"a": 1, "b": "two"},
        "empty_array": [],
        "empty_object": {},
    });
    store.add(OperationType::Create, vec![json!({"id": 1, "data": complex.clone()})]).await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected[0]["data"], complex);
}

// ============================================================================
// Primary key edge cases
// ============================================================================

#[tokio::test]
async fn special_character_primary_keys() {
    let store = model_store(vec![]);
    let ids = vec![
        json!("simple"),
        json!("with-dash"),
        json!("with_underscore"),
        json!("with.dots"),
        json!("with/slash"),
        json!("with:colon"),
        json!("emoji-🎉"),
        json!(""),
    ];
    for id in &ids {
        store.add(OperationType::Create, vec![json!({"id": id, "name": "test"})]).await;
    }
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected.len(), ids.len());
    for id in &ids {
        assert!(projected.iter().any(|r| r["id"] == *id), "missing record for id {id:?}");
    }
}

#[tokio::test]
async fn missing_or_null_primary_key_is_skipped_not_errored() {
    let store = model_store(vec![]);
    store.add(OperationType::Create, vec![json!({"name": "no id"})]).await;
    store.add(OperationType::Create, vec![json!({"id": null, "name": "null id"})]).await;
    let (_, projected) = store.full_projection().await;
    assert!(projected.is_empty());
}

// ============================================================================
// Operation ordering and lifecycle edge cases
// ============================================================================

#[tokio::test]
async fn rapid_updates_to_same_record_resolve_to_last_applied() {
    let store = model_store(vec![]);
    store.add(OperationType::Create, vec![json!({"id": 1, "name": "initial"})]).await;
    for i in 1..=100 {
        store.add(OperationType::Update, vec![json!({"id": 1, "name": format!("update_{i}")})]).await;
    }
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected[0]["name"], "update_100");
}

#[tokio::test]
async fn many_pending_operations_all_project() {
    let store = model_store(vec![]);
    for i in 0..1000u64 {
        store.add(OperationType::Create, vec![json!({"id": i, "name": format!("item_{i}")})]).await;
    }
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected.len(), 1000);
}

#[tokio::test]
async fn confirm_half_then_reject_the_rest_leaves_all_projected() {
    let store = model_store(vec![]);
    let mut ids = Vec::new();
    for i in 0..20u64 {
        let op_id = store.add(OperationType::Create, vec![json!({"id": i})]).await;
        ids.push(op_id);
    }
    for op_id in &ids[..10] {
        store.confirm(op_id, None).await;
    }
    for op_id in &ids[10..] {
        store.reject(op_id).await;
    }
    let (_, projected) = store.full_projection().await;
    // Rejected creates never projected in the first place; only the
    // confirmed half survives.
    assert_eq!(projected.len(), 10);
}

// ============================================================================
// Queryset edge cases
// ============================================================================

#[tokio::test]
async fn queryset_handles_duplicate_create_ids_idempotently() {
    let store = QuerySetStore::new(
        "saved_query",
        ripple_engine::config::QuerySetStoreConfig::new(),
        Arc::new(FixedIds(vec![])),
        None,
    );
    store.add(OperationType::Create, vec![json!(1), json!(1), json!(1)]).await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected.len(), 1);
}

#[tokio::test]
async fn queryset_many_collection_style_ids() {
    let ids: Vec<Value> = (0..200).map(|i| json!(format!("collection_{i}"))).collect();
    let store = QuerySetStore::new(
        "saved_query",
        ripple_engine::config::QuerySetStoreConfig::new(),
        Arc::new(FixedIds(ids.clone())),
        None,
    );
    store.sync().await;
    let (_, projected) = store.full_projection().await;
    assert_eq!(projected.len(), ids.len());
}
