//! Model Store: per-entity-type replica of records plus its pending
//! operation log.
//!
//! Owns its state behind a single lock and exposes a query surface over
//! it. `ensure_initialized` resolves once the first cache-load attempt
//! has settled, so concurrent callers all wait on the same attempt
//! instead of racing duplicate loads. `process_operations` folds ground
//! truth and the pending operation log into a single optimistic record
//! sequence - a deterministic, single-writer overlay, not a merge
//! between concurrent writers.

use crate::config::ModelStoreConfig;
use crate::event::{Event, EventBus, EventKind, RemovalReason, SubscriptionId};
use crate::fetch::GroundTruthFetcher;
use crate::operation::{new_operation_id, Operation, OperationChanges, OperationLog, OperationStatus, OperationType};
use crate::record::{extract_primary_key, pk_key, shallow_merge, RecordFactory};
use crate::storage::{ModelStoreSnapshot, Storage, SNAPSHOT_FORMAT_VERSION};
use crate::{Error, OperationId, StoreKey, Timestamp, Version};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A server-originated direct change, applied straight to ground truth
/// without lifecycle bookkeeping.
#[derive(Debug, Clone)]
pub enum LiveChange {
    Upsert(Value),
    Delete(Value),
}

struct Inner {
    ground_truth: Vec<Value>,
    operations: OperationLog,
    version: Version,
    last_sync_time: Option<Timestamp>,
    is_syncing: bool,
    is_stale: bool,
    events: EventBus,
}

impl Inner {
    fn empty() -> Self {
        Self {
            ground_truth: Vec::new(),
            operations: OperationLog::new(),
            version: 0,
            last_sync_time: None,
            is_syncing: false,
            is_stale: false,
            events: EventBus::new(),
        }
    }
}

/// Projects ground truth + an operation log into the optimistic record
/// sequence.
pub fn process_operations(
    ground_truth: &[Value],
    operations: &OperationLog,
    primary_key: &str,
    factory: Option<&RecordFactory>,
) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut result: std::collections::HashMap<String, Value> = std::collections::HashMap::new();

    for record in ground_truth {
        if let Some(pk) = extract_primary_key(record, primary_key) {
            let key = pk_key(&pk);
            if !result.contains_key(&key) {
                order.push(key.clone());
            }
            result.insert(key, record.clone());
        }
    }

    for op in operations.projectable_in_order() {
        for instance in &op.payload {
            let pk = match extract_primary_key(instance, primary_key) {
                Some(pk) => pk,
                None => continue,
            };
            let key = pk_key(&pk);
            match op.op_type {
                OperationType::Create => {
                    if !result.contains_key(&key) {
                        let value = match factory {
                            Some(f) => f(instance.clone()),
                            None => instance.clone(),
                        };
                        result.insert(key.clone(), value);
                        order.push(key);
                    }
                }
                OperationType::Update => {
                    if let Some(existing) = result.get_mut(&key) {
                        shallow_merge(existing, instance);
                    }
                }
                OperationType::Delete => {
                    if result.remove(&key).is_some() {
                        order.retain(|k| k != &key);
                    }
                }
            }
        }
    }

    order.into_iter().filter_map(|k| result.get(&k).cloned()).collect()
}

/// Owns ground-truth records plus the pending-operation log for one
/// entity type.
pub struct ModelStore {
    inner: Mutex<Inner>,
    init: OnceCell<Result<bool, Error>>,
    periodic_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    self_ref: std::sync::OnceLock<std::sync::Weak<ModelStore>>,
    config: ModelStoreConfig,
    key: StoreKey,
    fetcher: Arc<dyn GroundTruthFetcher>,
    storage: Option<Arc<dyn Storage>>,
}

impl ModelStore {
    pub fn new(
        key: impl Into<StoreKey>,
        config: ModelStoreConfig,
        fetcher: Arc<dyn GroundTruthFetcher>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Mutex::new(Inner::empty()),
            init: OnceCell::new(),
            periodic_task: std::sync::Mutex::new(None),
            self_ref: std::sync::OnceLock::new(),
            config,
            key: key.into(),
            fetcher,
            storage,
        });
        let _ = store.self_ref.set(Arc::downgrade(&store));
        store.start_periodic_sync();
        store
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn primary_key_field(&self) -> &str {
        &self.config.primary_key
    }

    /// Resolves once the first cache-load attempt has completed. A store
    /// with caching disabled has nothing to wait for and resolves `false`
    /// immediately.
    pub async fn ensure_initialized(&self) -> Result<bool, Error> {
        if !self.config.enable_cache {
            return Ok(false);
        }
        self.init
            .get_or_init(|| async { self.load_from_cache().await })
            .await
            .clone()
    }

    async fn load_from_cache(&self) -> Result<bool, Error> {
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        let cache_key = self.config.cache_key();

        let loaded = storage
            .load(&cache_key)
            .await
            .map_err(|e| Error::CacheLoadFailed { store: self.key.clone(), message: e.to_string() });

        let bytes = match loaded {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                *self.inner.lock().await = Inner::empty();
                return Ok(false);
            }
            Err(e) => {
                *self.inner.lock().await = Inner::empty();
                tracing::error!(store = %self.key, error = %e, "cache load failed");
                return Err(e);
            }
        };

        let snapshot = match ModelStoreSnapshot::from_json(&bytes) {
            Ok(s) => s,
            Err(e) => {
                *self.inner.lock().await = Inner::empty();
                tracing::error!(store = %self.key, error = %e, "cache deserialization failed");
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        inner.ground_truth = snapshot.ground_truth;
        inner.operations = OperationLog::from_btree_map(snapshot.operations);
        inner.version = snapshot.version;
        inner.last_sync_time = Some(snapshot.cached_at);
        inner.is_stale = true;
        let version = inner.version;
        inner.events.publish(&Event::CacheLoaded { version });
        drop(inner);

        if self.config.cache_auto_sync {
            if let Some(store) = self.self_ref.get().and_then(|w| w.upgrade()) {
                let delay = std::time::Duration::from_millis(self.config.cache_sync_delay_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    store.sync().await;
                });
            }
        }

        Ok(true)
    }

    /// Append a new `inflight` operation. Returns its generated id.
    pub async fn add(&self, op_type: OperationType, payload: Vec<Value>) -> OperationId {
        let mut inner = self.inner.lock().await;
        let op_id = new_operation_id();
        let op = Operation::new(op_id.clone(), op_type, payload, now_ms());
        inner.operations.insert(op);
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::OperationAdded { version, op_id: op_id.clone() });
        op_id
    }

    /// Mutate fields of an existing operation. Returns `false` if unknown.
    pub async fn update(&self, op_id: &str, changes: OperationChanges) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(op) = inner.operations.get_mut(op_id) else {
            return false;
        };
        if let Some(payload) = changes.payload {
            op.payload = payload;
        }
        if let Some(status) = changes.status {
            op.status = status;
        }
        if let Some(op_type) = changes.op_type {
            op.op_type = op_type;
        }
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::OperationUpdated { version, op_id: op_id.to_string() });
        true
    }

    /// Status -> confirmed, optionally replacing the payload with the
    /// server-authoritative instances (e.g. temp-id -> server-id
    /// resolution). Returns `false` if unknown.
    pub async fn confirm(&self, op_id: &str, replacement_instances: Option<Vec<Value>>) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(op) = inner.operations.get_mut(op_id) else {
            return false;
        };
        op.status = OperationStatus::Confirmed;
        if let Some(instances) = replacement_instances {
            op.payload = instances;
        }
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::StatusChanged {
            version,
            op_id: op_id.to_string(),
            status: OperationStatus::Confirmed,
        });
        true
    }

    /// Status -> rejected. Returns `false` if unknown.
    pub async fn reject(&self, op_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(op) = inner.operations.get_mut(op_id) else {
            return false;
        };
        op.status = OperationStatus::Rejected;
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::StatusChanged {
            version,
            op_id: op_id.to_string(),
            status: OperationStatus::Rejected,
        });
        true
    }

    /// Defensive copy of ground truth.
    pub async fn ground_truth(&self) -> Vec<Value> {
        self.inner.lock().await.ground_truth.clone()
    }

    pub async fn current_version(&self) -> Version {
        self.inner.lock().await.version
    }

    pub async fn is_syncing(&self) -> bool {
        self.inner.lock().await.is_syncing
    }

    pub async fn is_stale(&self) -> bool {
        self.inner.lock().await.is_stale
    }

    pub async fn last_sync_time(&self) -> Option<Timestamp> {
        self.inner.lock().await.last_sync_time
    }

    /// Current version plus the freshly (or cache-hit) projected
    /// sequence, for consumption by a `RenderEngine`.
    pub async fn full_projection(&self) -> (Version, Vec<Value>) {
        let inner = self.inner.lock().await;
        let projected = process_operations(
            &inner.ground_truth,
            &inner.operations,
            &self.config.primary_key,
            self.config.record_factory.as_ref(),
        );
        (inner.version, projected)
    }

    /// Apply a server-originated direct change to ground truth.
    pub async fn apply_live_event(&self, change: LiveChange) {
        let mut inner = self.inner.lock().await;
        let pk_field = self.config.primary_key.clone();
        match change {
            LiveChange::Upsert(instance) => {
                if let Some(pk) = extract_primary_key(&instance, &pk_field) {
                    let key = pk_key(&pk);
                    let existing = inner
                        .ground_truth
                        .iter_mut()
                        .find(|r| extract_primary_key(r, &pk_field).map(|v| pk_key(&v)) == Some(key.clone()));
                    match existing {
                        Some(record) => shallow_merge(record, &instance),
                        None => inner.ground_truth.push(instance),
                    }
                }
            }
            LiveChange::Delete(pk) => {
                let key = pk_key(&pk);
                inner
                    .ground_truth
                    .retain(|r| extract_primary_key(r, &pk_field).map(|v| pk_key(&v)) != Some(key.clone()));
            }
        }
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::GroundTruthUpdated { version });
    }

    /// Single-flight sync: fetch ground truth, trim, persist.
    pub async fn sync(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.is_syncing {
                return false;
            }
            inner.is_syncing = true;
            let version = inner.version;
            inner.events.publish(&Event::SyncStarted { version });
        }

        if self.config.enable_cache {
            let _ = self.ensure_initialized().await;
        }

        let fetched = match self.fetcher.fetch_ground_truth().await {
            Ok(fetched) => fetched,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.is_syncing = false;
                let version = inner.version;
                inner.events.publish(&Event::SyncError { version, message: e.to_string() });
                tracing::warn!(store = %self.key, error = %e, "ground truth fetch failed");
                return false;
            }
        };

        let snapshot_bytes = {
            let mut inner = self.inner.lock().await;
            let fetched = match &self.config.record_factory {
                Some(factory) => fetched.into_iter().map(|r| factory(r)).collect(),
                None => fetched,
            };
            inner.ground_truth = fetched;
            inner.version += 1;
            let version = inner.version;
            inner.events.publish(&Event::GroundTruthUpdated { version });

            let now = now_ms();
            let removed = inner.operations.trim(now, self.config.max_operation_age_ms);
            for op_id in removed {
                inner.events.publish(&Event::OperationRemoved {
                    version,
                    op_id,
                    reason: RemovalReason::Trimmed,
                });
            }

            inner.last_sync_time = Some(now);
            if inner.is_stale {
                inner.is_stale = false;
                inner.events.publish(&Event::StalenessChanged { version, is_stale: false });
            }

            if self.config.enable_cache {
                let snapshot = ModelStoreSnapshot {
                    format_version: SNAPSHOT_FORMAT_VERSION,
                    id: self.key.clone(),
                    ground_truth: inner.ground_truth.clone(),
                    operations: inner.operations.to_btree_map(),
                    version: inner.version,
                    cached_at: now,
                };
                snapshot.to_json().ok()
            } else {
                None
            }
        };

        if let (Some(storage), Some(bytes)) = (&self.storage, snapshot_bytes) {
            if let Err(e) = storage.save(&self.config.cache_key(), bytes).await {
                tracing::warn!(store = %self.key, error = %e, "cache save failed during sync");
            }
        }

        let mut inner = self.inner.lock().await;
        inner.is_syncing = false;
        let version = inner.version;
        inner.events.publish(&Event::SyncCompleted { version });
        true
    }

    pub async fn clear_cache(&self) {
        if let Some(storage) = &self.storage {
            let _ = storage.delete(&self.config.cache_key()).await;
        }
    }

    /// Start the periodic-sync scheduler, if configured. Waits for the
    /// initial cache-load attempt to settle before the first tick. Called
    /// automatically by `new`; idempotent re-invocation just replaces the
    /// running scheduler task.
    pub fn start_periodic_sync(self: &Arc<Self>) {
        if self.config.sync_interval_ms == 0 {
            return;
        }
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = store.ensure_initialized().await;
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(store.config.sync_interval_ms));
            interval.tick().await;
            loop {
                interval.tick().await;
                store.sync().await;
            }
        });
        *self.periodic_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Idempotent: stopping an already-stopped scheduler is a no-op.
    pub fn stop_sync(&self) {
        if let Ok(mut guard) = self.periodic_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    pub async fn subscribe(
        &self,
        kinds: Option<HashSet<EventKind>>,
        callback: Box<dyn Fn(&Event) + Send + Sync>,
    ) -> SubscriptionId {
        self.inner.lock().await.events.subscribe(kinds, callback)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().await.events.unsubscribe(id);
    }

    pub async fn destroy(&self) {
        self.stop_sync();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.close().await {
                tracing::warn!(store = %self.key, error = %e, "storage close failed during destroy");
            }
        }
        self.inner.lock().await.events = EventBus::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFetcher(Vec<Value>);

    #[async_trait]
    impl GroundTruthFetcher for FixedFetcher {
        async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl GroundTruthFetcher for FailingFetcher {
        async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError> {
            Err(FetchError("network down".into()))
        }
    }

    fn seed() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "Alice", "role": "admin"}),
            json!({"id": 2, "name": "Bob", "role": "user"}),
            json!({"id": 3, "name": "Charlie", "role": "user"}),
        ]
    }

    fn store_with(ground_truth: Vec<Value>) -> Arc<ModelStore> {
        let config = ModelStoreConfig::new("id");
        ModelStore::new("users", config, Arc::new(FixedFetcher(ground_truth)), None)
    }

    // S1 - basic CRUD.
    #[tokio::test]
    async fn s1_basic_crud() {
        let store = store_with(seed());
        store.sync().await;

        store
            .add(OperationType::Create, vec![json!({"id": 4, "name": "Dave", "role": "manager"})])
            .await;
        store.add(OperationType::Update, vec![json!({"id": 4, "role": "admin"})]).await;
        store.add(OperationType::Delete, vec![json!({"id": 1})]).await;

        let (_, mut projected) = store.full_projection().await;
        projected.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        let names: Vec<_> = projected.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Bob", "Charlie", "Dave"]);
        let dave = projected.iter().find(|r| r["name"] == "Dave").unwrap();
        assert_eq!(dave["role"], "admin");
    }

    // S3 - rejected-after-interleaving.
    #[tokio::test]
    async fn s3_rejected_after_interleaving() {
        let store = store_with(seed());
        store.sync().await;

        store.add(OperationType::Update, vec![json!({"id": 1, "name": "AliceV2"})]).await;
        let create_id = store.add(OperationType::Create, vec![json!({"id": 4})]).await;
        store.reject(&create_id).await;
        store.add(OperationType::Update, vec![json!({"id": 2, "name": "BobV2"})]).await;

        let (_, mut projected) = store.full_projection().await;
        projected.sort_by(|a, b| a["id"].as_i64().cmp(&b["id"].as_i64()));
        assert_eq!(projected.len(), 3);
        assert_eq!(projected[0]["name"], "AliceV2");
        assert_eq!(projected[1]["name"], "BobV2");
        assert_eq!(projected[2]["name"], "Charlie");
    }

    // S4 - trim at sync.
    #[tokio::test]
    async fn s4_trim_at_sync() {
        let config = ModelStoreConfig::new("id").with_max_operation_age_ms(100);
        let store = ModelStore::new("users", config, Arc::new(FixedFetcher(seed())), None);

        let op_id = store.add(OperationType::Update, vec![json!({"id": 1, "name": "X"})]).await;
        store.confirm(&op_id, None).await;

        {
            let mut inner = store.inner.lock().await;
            if let Some(op) = inner.operations.get_mut(&op_id) {
                op.timestamp -= 10_000;
            }
        }

        let inflight_id = store.add(OperationType::Update, vec![json!({"id": 2, "name": "Y"})]).await;
        {
            let mut inner = store.inner.lock().await;
            if let Some(op) = inner.operations.get_mut(&inflight_id) {
                op.timestamp -= 10_000;
            }
        }

        store.sync().await;

        let inner = store.inner.lock().await;
        assert!(!inner.operations.contains(&op_id));
        assert!(inner.operations.contains(&inflight_id));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_state_unchanged() {
        let store = ModelStore::new("users", ModelStoreConfig::new("id"), Arc::new(FailingFetcher), None);
        store.add(OperationType::Create, vec![json!({"id": 1})]).await;
        let before = store.full_projection().await;
        let ok = store.sync().await;
        assert!(!ok);
        assert!(!store.is_syncing().await);
        let after = store.full_projection().await;
        assert_eq!(before.1, after.1);
    }

    #[tokio::test]
    async fn cache_round_trip_preserves_operations_and_stale_flag() {
        let storage = Arc::new(MemoryStorage::new());
        let config = ModelStoreConfig::new("id").with_cache("app", "users");
        let store = ModelStore::new("users", config.clone(), Arc::new(FixedFetcher(seed())), Some(storage.clone()));
        store.sync().await;
        store.add(OperationType::Create, vec![json!({"id": 4, "name": "Dave"})]).await;
        let before = store.full_projection().await;
        store.destroy().await;

        let store2 = ModelStore::new("users", config, Arc::new(FixedFetcher(vec![])), Some(storage));
        let resolved = store2.ensure_initialized().await.unwrap();
        assert!(resolved);
        assert!(store2.is_stale().await);
        let after = store2.full_projection().await;
        assert_eq!(before.1, after.1);
    }

    #[tokio::test]
    async fn unknown_operation_id_returns_false() {
        let store = store_with(seed());
        assert!(!store.confirm("missing", None).await);
        assert!(!store.reject("missing").await);
        assert!(!store.update("missing", OperationChanges::default()).await);
    }

    #[tokio::test]
    async fn concurrent_sync_is_single_flight() {
        let store = store_with(seed());
        let (a, b) = tokio::join!(store.sync(), store.sync());
        assert!(a ^ b, "exactly one concurrent sync should win");
    }

    #[tokio::test]
    async fn subscriber_receives_sync_events() {
        let store = store_with(seed());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        store
            .subscribe(None, Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }))
            .await;
        store.sync().await;
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn live_event_upsert_and_delete() {
        let store = store_with(seed());
        store.sync().await;
        store.apply_live_event(LiveChange::Upsert(json!({"id": 2, "name": "Bobby"}))).await;
        let (_, projected) = store.full_projection().await;
        let bob = projected.iter().find(|r| r["id"] == 2).unwrap();
        assert_eq!(bob["name"], "Bobby");

        store.apply_live_event(LiveChange::Delete(json!(3))).await;
        let (_, projected) = store.full_projection().await;
        assert!(!projected.iter().any(|r| r["id"] == 3));
    }
}
