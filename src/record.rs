//! Records are opaque, primary-key-identified attribute maps.
//!
//! The core never interprets a record's attributes beyond extracting its
//! declared primary-key field. Everything else is caller-defined shape,
//! carried as a `serde_json::Value` object.

use serde_json::Value;

/// A record payload: a JSON object mapping attribute names to values.
///
/// Kept as a bare `serde_json::Value` (rather than a typed struct) because
/// the core is generic over whatever record shape the application defines;
/// typing individual fields is explicitly out of scope.
pub type RecordPayload = Value;

/// Optional caller-supplied hook that rehydrates a raw payload into its
/// application-specific representation (e.g. parsing timestamps, filling
/// defaults) before it enters ground truth or a projection. The engine
/// never depends on its output shape; it is threaded through opaquely.
pub type RecordFactory = std::sync::Arc<dyn Fn(RecordPayload) -> RecordPayload + Send + Sync>;

/// Extract the primary-key value from a record payload.
///
/// Returns `None` when `field` is absent or explicitly `null`, in which
/// case the projection algorithm skips the record rather than erroring.
pub fn extract_primary_key(payload: &RecordPayload, field: &str) -> Option<Value> {
    match payload {
        Value::Object(map) => match map.get(field) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.clone()),
        },
        // A bare scalar/array payload (e.g. a delete-op instance degraded
        // to just its identifier) is treated as the primary key itself.
        other => {
            if other.is_null() {
                None
            } else {
                Some(other.clone())
            }
        }
    }
}

/// Stable string key for a primary-key value, used wherever the
/// projection algorithm needs to key records by primary key in a
/// `HashMap` (`serde_json::Value` has no blanket `Hash` impl).
pub fn pk_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Shallow-merge `patch` onto `base`, preserving any key in `base` that
/// `patch` does not mention. Used by the `update` arm of the projection
/// algorithm.
pub fn shallow_merge(base: &mut RecordPayload, patch: &RecordPayload) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        (base_slot, _) => {
            *base_slot = patch.clone();
        }
    }
}
