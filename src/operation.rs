//! The pending-operation log shared by Model Stores and Queryset Stores.
//!
//! Changes are expressed as operations, not direct mutations to ground
//! truth: a local mutation is appended as an `Operation`, lives through
//! `inflight -> confirmed|rejected`, and is trimmed once it has aged past
//! `max_operation_age` (see `store_model`/`store_queryset`).

use crate::{OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of mutation an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Inflight,
    Confirmed,
    Rejected,
}

/// A single local mutation.
///
/// `payload` is a sequence of instances: for a Model Store these are
/// partial or full record payloads (a delete only needs the identifiers);
/// for a Queryset Store these are bare identifier values. The core never
/// distinguishes the two at this layer - see `record::extract_primary_key`
/// for how an instance's identity is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub op_id: OperationId,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub payload: Vec<Value>,
    pub timestamp: Timestamp,
}

impl Operation {
    /// Construct a freshly-added, `inflight` operation.
    pub fn new(op_id: OperationId, op_type: OperationType, payload: Vec<Value>, timestamp: Timestamp) -> Self {
        Self {
            op_id,
            op_type,
            status: OperationStatus::Inflight,
            payload,
            timestamp,
        }
    }
}

/// Partial update to an existing operation's fields, used by `update()`.
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct OperationChanges {
    pub payload: Option<Vec<Value>>,
    pub status: Option<OperationStatus>,
    pub op_type: Option<OperationType>,
}

/// Generate a new, time-ordered operation id (UUIDv7, so lexical order
/// tracks creation order closely, though nothing depends on that for
/// correctness - ties are broken by insertion order in `OperationLog`,
/// not by id comparison).
pub fn new_operation_id() -> OperationId {
    uuid::Uuid::now_v7().to_string()
}

/// An insertion-order-preserving map from operation id to `Operation`.
///
/// A plain `HashMap` doesn't preserve insertion order, and the projection
/// algorithm's tie-break ("ties broken by insertion order") needs that
/// order alongside O(1) lookup/removal by id. This pairs a lookup map
/// with a parallel order vector rather than pulling in an external
/// ordered-map crate.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    by_id: std::collections::HashMap<OperationId, Operation>,
    order: Vec<OperationId>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new operation, recording its insertion position.
    pub fn insert(&mut self, op: Operation) {
        if !self.by_id.contains_key(&op.op_id) {
            self.order.push(op.op_id.clone());
        }
        self.by_id.insert(op.op_id.clone(), op);
    }

    pub fn get(&self, op_id: &str) -> Option<&Operation> {
        self.by_id.get(op_id)
    }

    pub fn get_mut(&mut self, op_id: &str) -> Option<&mut Operation> {
        self.by_id.get_mut(op_id)
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.by_id.contains_key(op_id)
    }

    pub fn remove(&mut self, op_id: &str) -> Option<Operation> {
        let removed = self.by_id.remove(op_id);
        if removed.is_some() {
            self.order.retain(|id| id != op_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate all operations in insertion order.
    pub fn iter_in_order(&self) -> impl Iterator<Item = &Operation> {
        self.order.iter().filter_map(move |id| self.by_id.get(id))
    }

    /// Non-rejected operations, sorted by timestamp ascending with an
    /// insertion-order tiebreak.
    pub fn projectable_in_order(&self) -> Vec<&Operation> {
        let mut indexed: Vec<(usize, &Operation)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| self.by_id.get(id).map(|op| (idx, op)))
            .filter(|(_, op)| op.status != OperationStatus::Rejected)
            .collect();
        indexed.sort_by(|(ia, a), (ib, b)| a.timestamp.cmp(&b.timestamp).then(ia.cmp(ib)));
        indexed.into_iter().map(|(_, op)| op).collect()
    }

    /// Snapshot into a `BTreeMap` for deterministic serialization,
    /// following `examples/vsevex-carry/engine/src/snapshot.rs`'s choice
    /// of `BTreeMap` for its persisted collections.
    pub fn to_btree_map(&self) -> std::collections::BTreeMap<OperationId, Operation> {
        self.by_id.clone().into_iter().collect()
    }

    /// Rebuild a log from a persisted `BTreeMap`. Insertion order is
    /// reconstructed from key order, which is an acceptable
    /// approximation on warm-start: the original local insertion order
    /// is not itself persisted, only the operations and their timestamps,
    /// and the projection algorithm's tiebreak only matters among
    /// operations sharing a timestamp.
    pub fn from_btree_map(map: std::collections::BTreeMap<OperationId, Operation>) -> Self {
        let mut log = Self::new();
        for (_, op) in map {
            log.insert(op);
        }
        log
    }

    /// Remove every operation with `status != Inflight` older than
    /// `max_age_ms`. Returns the removed operation ids (used to emit
    /// `OperationRemoved` events).
    pub fn trim(&mut self, now: Timestamp, max_age_ms: i64) -> Vec<OperationId> {
        let mut removed = Vec::new();
        for id in self.order.clone() {
            if let Some(op) = self.by_id.get(&id) {
                if op.status != OperationStatus::Inflight && now.saturating_sub(op.timestamp) > max_age_ms {
                    removed.push(id);
                }
            }
        }
        for id in &removed {
            self.by_id.remove(id);
        }
        self.order.retain(|id| !removed.contains(id));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, ts: Timestamp, status: OperationStatus) -> Operation {
        Operation {
            op_id: id.to_string(),
            op_type: OperationType::Update,
            status,
            payload: vec![json!({"id": 1})],
            timestamp: ts,
        }
    }

    #[test]
    fn insertion_order_preserved() {
        let mut log = OperationLog::new();
        log.insert(op("a", 100, OperationStatus::Inflight));
        log.insert(op("b", 100, OperationStatus::Inflight));
        log.insert(op("c", 100, OperationStatus::Inflight));
        let ids: Vec<_> = log.iter_in_order().map(|o| o.op_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn projectable_sorts_by_timestamp_then_insertion() {
        let mut log = OperationLog::new();
        log.insert(op("a", 200, OperationStatus::Inflight));
        log.insert(op("b", 100, OperationStatus::Inflight));
        log.insert(op("c", 100, OperationStatus::Inflight));
        let order: Vec<_> = log
            .projectable_in_order()
            .into_iter()
            .map(|o| o.op_id.clone())
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn rejected_excluded_from_projectable() {
        let mut log = OperationLog::new();
        log.insert(op("a", 100, OperationStatus::Rejected));
        log.insert(op("b", 100, OperationStatus::Confirmed));
        let order: Vec<_> = log.projectable_in_order().into_iter().map(|o| o.op_id.clone()).collect();
        assert_eq!(order, vec!["b"]);
    }

    #[test]
    fn trim_removes_aged_non_inflight_only() {
        let mut log = OperationLog::new();
        log.insert(op("inflight", 0, OperationStatus::Inflight));
        log.insert(op("confirmed-old", 0, OperationStatus::Confirmed));
        log.insert(op("confirmed-new", 900, OperationStatus::Confirmed));
        let removed = log.trim(1000, 500);
        assert_eq!(removed, vec!["confirmed-old".to_string()]);
        assert!(log.contains("inflight"));
        assert!(log.contains("confirmed-new"));
        assert!(!log.contains("confirmed-old"));
    }

    #[test]
    fn new_operation_id_is_sortable_and_unique() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_ne!(a, b);
    }
}
