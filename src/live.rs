//! Live Wrapper: bundles a store with its render engine, forwards events
//! to external subscribers, and owns teardown order.
//!
//! Tracks external subscribers, broadcasts only the union of event kinds
//! they asked for, and detaches cleanly on teardown.

use crate::event::{Event, EventKind};
use crate::operation::{OperationChanges, OperationType};
use crate::render::{RenderEngine, RenderParams};
use crate::store_model::{LiveChange, ModelStore};
use crate::store_queryset::QuerySetStore;
use crate::{Error, OperationId, Version};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

struct ExternalSubscriber {
    kinds: Option<HashSet<EventKind>>,
    callback: Box<dyn Fn(&Event) + Send + Sync>,
}

/// Owns one Model Store + its Render Engine. Exposes the store's full
/// contract, plus `render`, and forwards store events to external
/// subscribers while only listening to the union of event types any of
/// them actually requested.
pub struct ModelLiveWrapper {
    store: Arc<ModelStore>,
    render_engine: Arc<RenderEngine>,
    external: Arc<std::sync::Mutex<HashMap<u64, ExternalSubscriber>>>,
    next_external_id: AtomicU64,
    forwarder_subscription: AsyncMutex<Option<crate::event::SubscriptionId>>,
    destroyed: AtomicBool,
}

impl ModelLiveWrapper {
    pub fn new(store: Arc<ModelStore>) -> Self {
        let render_engine = Arc::new(RenderEngine::new(store.clone()));
        Self {
            store,
            render_engine,
            external: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_external_id: AtomicU64::new(1),
            forwarder_subscription: AsyncMutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn add(&self, op_type: OperationType, payload: Vec<Value>) -> OperationId {
        if self.is_destroyed() {
            return String::new();
        }
        self.store.add(op_type, payload).await
    }

    pub async fn update(&self, op_id: &str, changes: OperationChanges) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.update(op_id, changes).await
    }

    pub async fn confirm(&self, op_id: &str, replacement: Option<Vec<Value>>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.confirm(op_id, replacement).await
    }

    pub async fn reject(&self, op_id: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.reject(op_id).await
    }

    pub async fn ground_truth(&self) -> Vec<Value> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.store.ground_truth().await
    }

    pub async fn render(&self, params: RenderParams) -> Vec<Value> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.render_engine.render(params).await
    }

    pub async fn sync(self: &Arc<Self>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.sync().await
    }

    pub async fn ensure_initialized(&self) -> Result<bool, Error> {
        if self.is_destroyed() {
            return Ok(false);
        }
        self.store.ensure_initialized().await
    }

    pub async fn clear_cache(&self) {
        if self.is_destroyed() {
            return;
        }
        self.store.clear_cache().await;
    }

    pub fn stop_sync(&self) {
        if self.is_destroyed() {
            return;
        }
        self.store.stop_sync();
    }

    pub async fn apply_live_event(&self, change: LiveChange) {
        if self.is_destroyed() {
            return;
        }
        self.store.apply_live_event(change).await;
    }

    /// Register an external subscriber. Returns a no-op handle (`0`) if
    /// the wrapper has already been destroyed.
    pub async fn subscribe(
        &self,
        kinds: Option<HashSet<EventKind>>,
        callback: Box<dyn Fn(&Event) + Send + Sync>,
    ) -> u64 {
        if self.is_destroyed() {
            return 0;
        }
        let id = self.next_external_id.fetch_add(1, Ordering::SeqCst);
        self.external.lock().unwrap().insert(id, ExternalSubscriber { kinds, callback });
        self.resync_forwarder().await;
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        if id == 0 {
            return;
        }
        self.external.lock().unwrap().remove(&id);
        if !self.is_destroyed() {
            self.resync_forwarder().await;
        }
    }

    /// Recompute the union of event kinds any external subscriber wants
    /// and re-subscribe a single forwarder to the store with that filter
    /// (or no filter at all, if any subscriber wants everything).
    async fn resync_forwarder(&self) {
        let subs_empty;
        let kind_filter: Option<HashSet<EventKind>>;
        {
            let subs = self.external.lock().unwrap();
            subs_empty = subs.is_empty();
            let mut any_all = false;
            let mut union = HashSet::new();
            for sub in subs.values() {
                match &sub.kinds {
                    None => any_all = true,
                    Some(kinds) => union.extend(kinds.iter().copied()),
                }
            }
            kind_filter = if any_all { None } else { Some(union) };
        }

        let mut forwarder = self.forwarder_subscription.lock().await;
        if let Some(old_id) = forwarder.take() {
            self.store.unsubscribe(old_id).await;
        }
        if !subs_empty {
            let external = Arc::clone(&self.external);
            let new_id = self
                .store
                .subscribe(
                    kind_filter,
                    Box::new(move |event: &Event| {
                        let subs = external.lock().unwrap();
                        for sub in subs.values() {
                            let wants = sub.kinds.as_ref().map(|k| k.contains(&event.kind())).unwrap_or(true);
                            if wants {
                                (sub.callback)(event);
                            }
                        }
                    }),
                )
                .await;
            *forwarder = Some(new_id);
        }
    }

    pub async fn current_version(&self) -> Version {
        self.store.current_version().await
    }

    /// Teardown in the order: external forwarder -> render-engine cache
    /// -> store. After this, every method above returns its safe default.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(old_id) = self.forwarder_subscription.lock().await.take() {
            self.store.unsubscribe(old_id).await;
        }
        self.external.lock().unwrap().clear();
        self.render_engine.clear_cache().await;
        self.store.destroy().await;
    }
}

/// Owns one Queryset Store + its Queryset Render Engine. Same
/// contract-passthrough/forwarding/teardown shape as `ModelLiveWrapper`,
/// specialized to identifier sequences.
pub struct QuerySetLiveWrapper {
    store: Arc<QuerySetStore>,
    render_engine: Arc<crate::render::QuerySetRenderEngine>,
    external: Arc<std::sync::Mutex<HashMap<u64, ExternalSubscriber>>>,
    next_external_id: AtomicU64,
    forwarder_subscription: AsyncMutex<Option<crate::event::SubscriptionId>>,
    destroyed: AtomicBool,
}

impl QuerySetLiveWrapper {
    pub fn new(store: Arc<QuerySetStore>) -> Self {
        let render_engine = Arc::new(crate::render::QuerySetRenderEngine::new(store.clone()));
        Self {
            store,
            render_engine,
            external: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_external_id: AtomicU64::new(1),
            forwarder_subscription: AsyncMutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn add(&self, op_type: OperationType, payload: Vec<Value>) -> OperationId {
        if self.is_destroyed() {
            return String::new();
        }
        self.store.add(op_type, payload).await
    }

    pub async fn confirm(&self, op_id: &str, replacement: Option<Vec<Value>>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.confirm(op_id, replacement).await
    }

    pub async fn reject(&self, op_id: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.reject(op_id).await
    }

    pub async fn render(&self, params: RenderParams) -> Vec<Value> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.render_engine.render(params).await
    }

    pub async fn count(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }
        self.render_engine.count().await
    }

    pub async fn current_ids(&self) -> Vec<Value> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.store.ground_truth_ids().await
    }

    pub async fn sync(self: &Arc<Self>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.store.sync().await
    }

    pub async fn subscribe(
        &self,
        kinds: Option<HashSet<EventKind>>,
        callback: Box<dyn Fn(&Event) + Send + Sync>,
    ) -> u64 {
        if self.is_destroyed() {
            return 0;
        }
        let id = self.next_external_id.fetch_add(1, Ordering::SeqCst);
        self.external.lock().unwrap().insert(id, ExternalSubscriber { kinds, callback });
        self.resync_forwarder().await;
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        if id == 0 {
            return;
        }
        self.external.lock().unwrap().remove(&id);
        if !self.is_destroyed() {
            self.resync_forwarder().await;
        }
    }

    async fn resync_forwarder(&self) {
        let subs_empty;
        let kind_filter: Option<HashSet<EventKind>>;
        {
            let subs = self.external.lock().unwrap();
            subs_empty = subs.is_empty();
            let mut any_all = false;
            let mut union = HashSet::new();
            for sub in subs.values() {
                match &sub.kinds {
                    None => any_all = true,
                    Some(kinds) => union.extend(kinds.iter().copied()),
                }
            }
            kind_filter = if any_all { None } else { Some(union) };
        }

        let mut forwarder = self.forwarder_subscription.lock().await;
        if let Some(old_id) = forwarder.take() {
            self.store.unsubscribe(old_id).await;
        }
        if !subs_empty {
            let external = Arc::clone(&self.external);
            let new_id = self
                .store
                .subscribe(
                    kind_filter,
                    Box::new(move |event: &Event| {
                        let subs = external.lock().unwrap();
                        for sub in subs.values() {
                            let wants = sub.kinds.as_ref().map(|k| k.contains(&event.kind())).unwrap_or(true);
                            if wants {
                                (sub.callback)(event);
                            }
                        }
                    }),
                )
                .await;
            *forwarder = Some(new_id);
        }
    }

    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(old_id) = self.forwarder_subscription.lock().await.take() {
            self.store.unsubscribe(old_id).await;
        }
        self.external.lock().unwrap().clear();
        self.render_engine.clear_cache().await;
        self.store.destroy().await;
    }
}
