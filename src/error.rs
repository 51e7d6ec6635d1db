//! Error types for the ripple sync engine.

use crate::{StoreKey, Version};
use thiserror::Error;

/// All possible errors surfaced by the engine to a caller.
///
/// Most routine misuse (unknown operation id, access after destroy) is
/// reported with a sentinel return value (`false`, an empty vec, a no-op
/// id) rather than an `Error` variant. The variants here are reserved
/// for failures that can't be folded into a sentinel without losing
/// information the caller needs: a failed fetch or cache operation, a
/// malformed or outdated persisted record, a misconfigured store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("missing required config: {0}")]
    MissingConfig(&'static str),

    #[error("primary key field '{0}' missing or null on record")]
    MissingPrimaryKey(String),

    #[error("metric strategy '{strategy}' requires a field but none was given")]
    MetricFieldRequired { strategy: &'static str },

    #[error("fetch failed for store '{store}': {message}")]
    FetchFailed { store: StoreKey, message: String },

    #[error("cache load failed for store '{store}': {message}")]
    CacheLoadFailed { store: StoreKey, message: String },

    #[error("cache deserialization failed for store '{store}': {message}")]
    CacheCorrupt { store: StoreKey, message: String },

    #[error("cache save failed for store '{store}': {message}")]
    CacheSaveFailed { store: StoreKey, message: String },

    #[error("persisted record has unsupported format version {got}, expected <= {max}")]
    UnsupportedSnapshotVersion { got: u32, max: u32 },

    #[error("store '{store}' has no registered primary key for type")]
    NoPrimaryKeyForType { store: StoreKey },

    #[error("version mismatch observing store '{store}': expected {expected}, got {actual}")]
    VersionMismatch {
        store: StoreKey,
        expected: Version,
        actual: Version,
    },
}

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
