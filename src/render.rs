//! Render Engine and Queryset Render Engine: version-keyed memoized,
//! filterable, paginated read views over a store.

use crate::record::{extract_primary_key, pk_key};
use crate::store_model::ModelStore;
use crate::store_queryset::QuerySetStore;
use crate::Version;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A comparator used to order a rendered sequence. Boxed so callers can
/// supply closures capturing arbitrary sort keys.
pub type SortFn = Arc<dyn Fn(&Value, &Value) -> std::cmp::Ordering + Send + Sync>;

/// Parameters to a `render()` call.
#[derive(Clone, Default)]
pub struct RenderParams {
    pub offset: usize,
    pub limit: Option<usize>,
    pub sort_fn: Option<SortFn>,
    /// Intersect the projection by primary key. `Some(vec![])` yields an
    /// empty result; `None` means "no filter".
    pub pks: Option<Vec<Value>>,
}

impl RenderParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, sort_fn: SortFn) -> Self {
        self.sort_fn = Some(sort_fn);
        self
    }

    pub fn with_pks(mut self, pks: Vec<Value>) -> Self {
        self.pks = Some(pks);
        self
    }
}

fn paginate(mut items: Vec<Value>, params: &RenderParams) -> Vec<Value> {
    if let Some(sort_fn) = &params.sort_fn {
        items.sort_by(|a, b| sort_fn(a, b));
    }
    let start = params.offset.min(items.len());
    let end = match params.limit {
        Some(limit) => (start + limit).min(items.len()),
        None => items.len(),
    };
    items[start..end].to_vec()
}

/// Memoized full-projection cache keyed by store version. Every store
/// mutation bumps `version`, so comparing the cached version against the
/// store's current version behaves like change-notification-driven
/// invalidation without an actual subscription.
struct Cache {
    version: Option<Version>,
    projection: Vec<Value>,
}

/// Renders a Model Store's ground truth + pending operations into an
/// ordered, paginated, optionally PK-filtered view.
pub struct RenderEngine {
    store: Arc<ModelStore>,
    cache: Mutex<Cache>,
}

impl RenderEngine {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache { version: None, projection: Vec::new() }),
        }
    }

    pub async fn render(&self, params: RenderParams) -> Vec<Value> {
        let current_version = self.store.current_version().await;
        let mut cache = self.cache.lock().await;
        if cache.version != Some(current_version) {
            let (version, projected) = self.store.full_projection().await;
            cache.version = Some(version);
            cache.projection = projected;
        }
        let mut items = cache.projection.clone();
        drop(cache);

        if let Some(pks) = &params.pks {
            let wanted: HashSet<String> = pks.iter().map(pk_key).collect();
            let pk_field = self.store.primary_key_field().to_string();
            items.retain(|record| {
                extract_primary_key(record, &pk_field)
                    .map(|pk| wanted.contains(&pk_key(&pk)))
                    .unwrap_or(false)
            });
        }

        paginate(items, &params)
    }

    /// Invalidate the memoized projection unconditionally. Exposed for
    /// callers (e.g. a `LiveWrapper` on teardown) that want to drop
    /// retained memory without waiting for a version bump.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.version = None;
        cache.projection = Vec::new();
    }
}

/// Renders a Queryset Store's identifier set into an ordered, paginated
/// view.
pub struct QuerySetRenderEngine {
    store: Arc<QuerySetStore>,
    cache: Mutex<Cache>,
}

impl QuerySetRenderEngine {
    pub fn new(store: Arc<QuerySetStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache { version: None, projection: Vec::new() }),
        }
    }

    pub async fn render(&self, params: RenderParams) -> Vec<Value> {
        let items = self.refreshed_projection().await;
        paginate(items, &params)
    }

    pub async fn count(&self) -> usize {
        self.refreshed_projection().await.len()
    }

    async fn refreshed_projection(&self) -> Vec<Value> {
        let current_version = self.store.current_version().await;
        let mut cache = self.cache.lock().await;
        if cache.version != Some(current_version) {
            let (version, projected) = self.store.full_projection().await;
            cache.version = Some(version);
            cache.projection = projected;
        }
        cache.projection.clone()
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.version = None;
        cache.projection = Vec::new();
    }
}
