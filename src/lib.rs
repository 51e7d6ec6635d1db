//! # Ripple Engine
//!
//! A deterministic optimistic-sync engine for local-first applications.
//!
//! This crate provides the core logic for rendering an authoritative,
//! server-fetched record sequence overlaid with not-yet-confirmed local
//! operations into a single consistent view - the same ground truth plus
//! the same pending operations always renders the same projection.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never opens a socket or a file; ground truth,
//!   query sets, and metrics are supplied by caller-provided fetchers
//!   ([`fetch::GroundTruthFetcher`], [`fetch::QuerySetFetcher`],
//!   [`fetch::MetricFetcher`]), and persistence goes through the caller's
//!   [`storage::Storage`] implementation.
//! - **Deterministic**: the projection algorithm in [`store_model`] and
//!   [`store_queryset`] is a pure function of ground truth, the pending
//!   operation log, and (where relevant) a primary key field.
//! - **Cooperative concurrency**: every store's internal state is behind
//!   a single `tokio::sync::Mutex`, held only across synchronous sections
//!   - never across an `.await` - so store methods interleave at `.await`
//!   points but never observe a torn update.
//!
//! ## Core Concepts
//!
//! ### Records and operations
//!
//! Records are opaque, primary-key-identified JSON objects (see
//! [`record`]). Local changes are never applied to ground truth directly;
//! they are appended as an [`operation::Operation`] - [`operation::OperationType::Create`],
//! [`operation::OperationType::Update`], or [`operation::OperationType::Delete`] -
//! that lives through `inflight -> confirmed | rejected` and is eventually
//! trimmed once it has aged past its store's configured retention window.
//!
//! ### Model Store and Queryset Store
//!
//! [`store_model::ModelStore`] holds one entity type's ground-truth
//! records plus its pending operation log. [`store_queryset::QuerySetStore`]
//! holds the identifier sequence a single saved query currently matches,
//! using the same sync/cache/trim machinery but set semantics instead of
//! a primary-key map.
//!
//! ### Render Engine and Metric Engine
//!
//! [`render::RenderEngine`] and [`render::QuerySetRenderEngine`] project a
//! store into a paginated, sorted, optionally filtered view, memoized by
//! store version. [`metric::MetricEngine`] computes an optimistic
//! aggregate ([`metric::Count`], [`metric::Sum`], [`metric::Min`],
//! [`metric::Max`]) by diffing the pending operations against a
//! server-supplied base value.
//!
//! ### Live Wrapper and Store Manager
//!
//! [`live::ModelLiveWrapper`] and [`live::QuerySetLiveWrapper`] bundle a
//! store with its render engine and forward store events to external
//! subscribers, listening to only the union of event kinds any of them
//! actually requested. [`manager::StoreManager`] owns the registry of
//! Model Stores and Queryset Stores backing a set of live queries and
//! ingests query responses from the network layer.
//!
//! ## Quick Start
//!
//! ```rust
//! use ripple_engine::config::ModelStoreConfig;
//! use ripple_engine::fetch::{FetchError, GroundTruthFetcher};
//! use ripple_engine::operation::OperationType;
//! use ripple_engine::store_model::ModelStore;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct FixedUsers;
//!
//! #[async_trait]
//! impl GroundTruthFetcher for FixedUsers {
//!     async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError> {
//!         Ok(vec![json!({"id": 1, "name": "Alice"})])
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = ModelStore::new("users", ModelStoreConfig::new("id"), Arc::new(FixedUsers), None);
//! store.sync().await;
//! store.add(OperationType::Create, vec![json!({"id": 2, "name": "Bob"})]).await;
//! let (_, projection) = store.full_projection().await;
//! assert_eq!(projection.len(), 2);
//! # }
//! ```
//!
//! ## Persistence
//!
//! Caching is opt-in per store via [`config::ModelStoreConfig::with_cache`]
//! / [`config::QuerySetStoreConfig::with_cache`] and a caller-supplied
//! [`storage::Storage`] implementation. Persisted records use a
//! `format_version` field so a future incompatible shape change can be
//! detected and rejected rather than silently misread
//! ([`storage::SNAPSHOT_FORMAT_VERSION`]).

pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod live;
pub mod manager;
pub mod metric;
pub mod operation;
pub mod record;
pub mod render;
pub mod storage;
pub mod store_model;
pub mod store_queryset;

pub use config::{ModelStoreConfig, QuerySetStoreConfig};
pub use error::Error;
pub use event::{Event, EventBus, EventKind, RemovalReason, SubscriptionId};
pub use fetch::{FetchError, GroundTruthFetcher, MetricFetcher, QuerySetFetcher};
pub use live::{ModelLiveWrapper, QuerySetLiveWrapper};
pub use manager::StoreManager;
pub use metric::{Count, Max, Metric, MetricEngine, Min, Strategy, Sum};
pub use operation::{new_operation_id, Operation, OperationChanges, OperationLog, OperationStatus, OperationType};
pub use record::{extract_primary_key, pk_key, shallow_merge, RecordFactory, RecordPayload};
pub use render::{QuerySetRenderEngine, RenderEngine, RenderParams, SortFn};
pub use storage::{MemoryStorage, Storage, StorageError, ModelStoreSnapshot, QuerySetStoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store_model::{LiveChange, ModelStore};
pub use store_queryset::QuerySetStore;

/// Identifies a store instance (a collection name, or a query's stable
/// key) across the sync/cache/event surface.
pub type StoreKey = String;

/// Identifies a single pending operation. UUIDv7 in practice (see
/// [`operation::new_operation_id`]), but callers should treat it as an
/// opaque string.
pub type OperationId = String;

/// Monotonically increasing per-store revision counter. Bumped by every
/// mutation (ground truth replacement, operation add/update/status
/// change/removal); used to key render/metric memoization and to observe
/// "has anything changed since I last looked."
pub type Version = u64;

/// Milliseconds since the Unix epoch. Signed so operation-age arithmetic
/// (`now - operation.timestamp`) can use `saturating_sub` without
/// worrying about an operation timestamp briefly exceeding "now" under
/// clock skew.
pub type Timestamp = i64;
