//! Queryset Store: per-query replica of the identifier set a server-side
//! query currently matches.
//!
//! Structurally identical to `ModelStore` (same sync/cache/trim
//! machinery, same lock-per-mutation shape) but its projection uses set
//! semantics over identifiers rather than a primary-key map over
//! records.

use crate::config::QuerySetStoreConfig;
use crate::event::{Event, EventBus, EventKind, RemovalReason, SubscriptionId};
use crate::fetch::QuerySetFetcher;
use crate::operation::{new_operation_id, Operation, OperationChanges, OperationLog, OperationStatus, OperationType};
use crate::record::pk_key;
use crate::storage::{QuerySetStoreSnapshot, Storage, SNAPSHOT_FORMAT_VERSION};
use crate::{Error, OperationId, StoreKey, Timestamp, Version};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

struct Inner {
    ground_truth_ids: Vec<Value>,
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
            ground_truth_ids: Vec::new(),
            operations: OperationLog::new(),
            version: 0,
            last_sync_time: None,
            is_syncing: false,
            is_stale: false,
            events: EventBus::new(),
        }
    }
}

/// Project ground-truth ids + the operation log into the optimistic
/// identifier set. Output order is not guaranteed.
pub fn process_operation_ids(ground_truth_ids: &[Value], operations: &OperationLog) -> Vec<Value> {
    let mut set: HashMap<String, Value> = HashMap::new();
    for id in ground_truth_ids {
        set.insert(pk_key(id), id.clone());
    }
    for op in operations.projectable_in_order() {
        match op.op_type {
            OperationType::Create => {
                for id in &op.payload {
                    set.insert(pk_key(id), id.clone());
                }
            }
            OperationType::Delete => {
                for id in &op.payload {
                    set.remove(&pk_key(id));
                }
            }
            // Queryset update ops are accepted but have no effect on
            // membership; retained for lifecycle/event propagation.
            OperationType::Update => {}
        }
    }
    set.into_values().collect()
}

/// Owns the ground-truth id sequence plus the pending-operation log for
/// one saved query.
pub struct QuerySetStore {
    inner: Mutex<Inner>,
    init: OnceCell<Result<bool, Error>>,
    periodic_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    self_ref: std::sync::OnceLock<std::sync::Weak<QuerySetStore>>,
    config: QuerySetStoreConfig,
    key: StoreKey,
    fetcher: Arc<dyn QuerySetFetcher>,
    storage: Option<Arc<dyn Storage>>,
}

impl QuerySetStore {
    pub fn new(
        key: impl Into<StoreKey>,
        config: QuerySetStoreConfig,
        fetcher: Arc<dyn QuerySetFetcher>,
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

        let snapshot = match QuerySetStoreSnapshot::from_json(&bytes) {
            Ok(s) => s,
            Err(e) => {
                *self.inner.lock().await = Inner::empty();
                tracing::error!(store = %self.key, error = %e, "cache deserialization failed");
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        inner.ground_truth_ids = snapshot.ground_truth_ids;
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

    pub async fn ground_truth_ids(&self) -> Vec<Value> {
        self.inner.lock().await.ground_truth_ids.clone()
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

    /// Replace ground-truth ids wholesale, used by the Store Manager when
    /// ingesting a query response. Bumps version like any other
    /// ground-truth-affecting mutation.
    pub async fn replace_ground_truth_ids(&self, ids: Vec<Value>) {
        let mut inner = self.inner.lock().await;
        inner.ground_truth_ids = ids;
        inner.version += 1;
        let version = inner.version;
        inner.events.publish(&Event::GroundTruthUpdated { version });
    }

    pub async fn full_projection(&self) -> (Version, Vec<Value>) {
        let inner = self.inner.lock().await;
        (inner.version, process_operation_ids(&inner.ground_truth_ids, &inner.operations))
    }

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

        let fetched = match self.fetcher.fetch_query_set().await {
            Ok(fetched) => fetched,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.is_syncing = false;
                let version = inner.version;
                inner.events.publish(&Event::SyncError { version, message: e.to_string() });
                tracing::warn!(store = %self.key, error = %e, "queryset fetch failed");
                return false;
            }
        };

        let snapshot_bytes = {
            let mut inner = self.inner.lock().await;
            inner.ground_truth_ids = fetched;
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
                let snapshot = QuerySetStoreSnapshot {
                    format_version: SNAPSHOT_FORMAT_VERSION,
                    id: self.key.clone(),
                    ground_truth_ids: inner.ground_truth_ids.clone(),
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
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedFetcher(Vec<Value>);

    #[async_trait]
    impl QuerySetFetcher for FixedFetcher {
        async fn fetch_query_set(&self) -> Result<Vec<Value>, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn store_with(ids: Vec<Value>) -> Arc<QuerySetStore> {
        QuerySetStore::new("saved_query", QuerySetStoreConfig::new(), Arc::new(FixedFetcher(ids)), None)
    }

    // S6 - queryset rejection.
    #[tokio::test]
    async fn s6_queryset_rejection() {
        let store = store_with(vec![json!(1), json!(2), json!(3)]);
        store.sync().await;

        let op_id = store.add(OperationType::Create, vec![json!(4)]).await;
        store.reject(&op_id).await;

        let (_, projected) = store.full_projection().await;
        assert_eq!(projected.len(), 3);
        assert!(!projected.contains(&json!(4)));
    }

    #[tokio::test]
    async fn update_op_does_not_affect_membership() {
        let store = store_with(vec![json!(1)]);
        store.sync().await;
        store.add(OperationType::Update, vec![json!(1)]).await;
        let (_, projected) = store.full_projection().await;
        assert_eq!(projected.len(), 1);
    }

    #[tokio::test]
    async fn create_then_delete_nets_to_absent() {
        let store = store_with(vec![]);
        let op_id = store.add(OperationType::Create, vec![json!(9)]).await;
        store.confirm(&op_id, None).await;
        store.add(OperationType::Delete, vec![json!(9)]).await;
        let (_, projected) = store.full_projection().await;
        assert!(projected.is_empty());
    }
}
