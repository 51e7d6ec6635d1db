//! Store Manager: routes server responses to the Model Store / Queryset
//! Store pair they belong to, keyed by a stable hash of the query AST.
//!
//! Owns a registry of named collections behind a lock, generalized to
//! two registries - one by type name, one by query hash - rather than
//! one.

use crate::config::QuerySetStoreConfig;
use crate::fetch::{FetchError, GroundTruthFetcher, QuerySetFetcher};
use crate::operation::OperationType;
use crate::record::RecordFactory;
use crate::store_model::ModelStore;
use crate::store_queryset::QuerySetStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single typed resource inside a server response, JSON:API-shaped:
/// a declared `type`, an `id`, and an opaque attribute object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseResource {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: Value,
    #[serde(default)]
    pub attributes: Value,
}

/// A server response to a single query: its top-level (primary) resources
/// plus any side-loaded (included) resources of other types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub primary: Vec<ResponseResource>,
    #[serde(default)]
    pub included: Vec<ResponseResource>,
}

fn resource_to_record(resource: &ResponseResource, primary_key: &str) -> Value {
    let mut object = match &resource.attributes {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    object.insert(primary_key.to_string(), resource.id.clone());
    Value::Object(object)
}

/// Per-type registration: the field that identifies a record, plus an
/// optional rehydration hook threaded through to the Model Store it backs.
#[derive(Clone)]
pub struct TypeMetadata {
    pub primary_key: String,
    pub record_factory: Option<RecordFactory>,
}

impl TypeMetadata {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self { primary_key: primary_key.into(), record_factory: None }
    }

    pub fn with_record_factory(mut self, factory: RecordFactory) -> Self {
        self.record_factory = Some(factory);
        self
    }
}

/// Compute a stable hash over a query AST, used both as the Queryset
/// Store key and as the lookup key into a manager's queryset config map.
/// Relies on `serde_json`'s default (`BTreeMap`-backed, order-independent)
/// object serialization for stability across equivalent ASTs.
pub fn hash_ast(ast: &Value) -> String {
    let canonical = serde_json::to_string(ast).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Stores created by the manager are populated directly from
/// `process_response`, not through a background fetch; their `sync()`
/// path is unused by the manager and has nothing to fetch from.
struct UnavailableFetcher;

#[async_trait]
impl GroundTruthFetcher for UnavailableFetcher {
    async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError> {
        Err(FetchError("manager-owned store has no independent fetcher".into()))
    }
}

#[async_trait]
impl QuerySetFetcher for UnavailableFetcher {
    async fn fetch_query_set(&self) -> Result<Vec<Value>, FetchError> {
        Err(FetchError("manager-owned store has no independent fetcher".into()))
    }
}

/// Owns every Model Store / Queryset Store instantiated to back a set of
/// live queries, and routes incoming server responses into them.
pub struct StoreManager {
    type_registry: HashMap<String, TypeMetadata>,
    query_set_configs: HashMap<String, QuerySetStoreConfig>,
    model_stores: Mutex<HashMap<String, Arc<ModelStore>>>,
    query_set_stores: Mutex<HashMap<String, Arc<QuerySetStore>>>,
}

impl StoreManager {
    pub fn new(
        type_registry: HashMap<String, TypeMetadata>,
        query_set_configs: HashMap<String, QuerySetStoreConfig>,
    ) -> Self {
        Self {
            type_registry,
            query_set_configs,
            model_stores: Mutex::new(HashMap::new()),
            query_set_stores: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest a server response for query `ast`: group its primary and
    /// side-loaded resources by declared type, confirm-on-arrival into
    /// each type's Model Store, then replace the query's Queryset Store
    /// ground-truth ids with the primary resources' identifiers.
    pub async fn process_response(&self, ast: &Value, payload: ResponsePayload) {
        let mut by_type: HashMap<String, Vec<&ResponseResource>> = HashMap::new();
        for resource in payload.primary.iter().chain(payload.included.iter()) {
            by_type.entry(resource.type_name.clone()).or_default().push(resource);
        }

        for (type_name, resources) in by_type {
            let Some(metadata) = self.type_registry.get(&type_name) else {
                tracing::warn!(r#type = %type_name, "no registered primary key for type, skipping");
                continue;
            };
            let store = self.model_store_or_create(&type_name, metadata).await;
            let records: Vec<Value> = resources.iter().map(|r| resource_to_record(r, &metadata.primary_key)).collect();
            let op_id = store.add(OperationType::Update, records).await;
            store.confirm(&op_id, None).await;
        }

        let hash = hash_ast(ast);
        let primary_ids: Vec<Value> = payload.primary.iter().map(|r| r.id.clone()).collect();
        let query_set = self.query_set_store_or_create(&hash).await;
        query_set.replace_ground_truth_ids(primary_ids).await;
    }

    async fn model_store_or_create(&self, type_name: &str, metadata: &TypeMetadata) -> Arc<ModelStore> {
        let mut stores = self.model_stores.lock().await;
        if let Some(store) = stores.get(type_name) {
            return store.clone();
        }
        let mut config = crate::config::ModelStoreConfig::new(metadata.primary_key.clone());
        if let Some(factory) = &metadata.record_factory {
            config = config.with_record_factory(factory.clone());
        }
        let store = ModelStore::new(type_name.to_string(), config, Arc::new(UnavailableFetcher), None);
        stores.insert(type_name.to_string(), store.clone());
        store
    }

    async fn query_set_store_or_create(&self, hash: &str) -> Arc<QuerySetStore> {
        let mut stores = self.query_set_stores.lock().await;
        if let Some(store) = stores.get(hash) {
            return store.clone();
        }
        let config = self.query_set_configs.get(hash).cloned().unwrap_or_default();
        let store = QuerySetStore::new(hash.to_string(), config, Arc::new(UnavailableFetcher), None);
        stores.insert(hash.to_string(), store.clone());
        store
    }

    /// Lookup only - does not create.
    pub async fn model_store(&self, type_name: &str) -> Option<Arc<ModelStore>> {
        self.model_stores.lock().await.get(type_name).cloned()
    }

    /// Lookup only - does not create. Accepts either a precomputed hash
    /// or a query AST (hashed internally).
    pub async fn query_set_store(&self, hash: &str) -> Option<Arc<QuerySetStore>> {
        self.query_set_stores.lock().await.get(hash).cloned()
    }

    /// Settle destruction of every owned store, then drop them.
    pub async fn destroy(&self) {
        let model_stores = std::mem::take(&mut *self.model_stores.lock().await);
        for store in model_stores.values() {
            store.destroy().await;
        }
        let query_set_stores = std::mem::take(&mut *self.query_set_stores.lock().await);
        for store in query_set_stores.values() {
            store.destroy().await;
        }
    }
}
