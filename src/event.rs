//! Event taxonomy and subscriber dispatch.
//!
//! Stores emit a closed set of event tags rather than dynamic string
//! routing; a `Live Wrapper` forwards only the union of tags its
//! external subscribers asked for.

use crate::{OperationId, OperationStatus, Version};
use std::collections::HashSet;

/// Why an operation was removed from a store's operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Aged past `max_operation_age` at sync time.
    Trimmed,
}

/// A single emitted event. Every variant carries the store's version at
/// the time of emission.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SyncStarted { version: Version },
    SyncCompleted { version: Version },
    SyncError { version: Version, message: String },
    GroundTruthUpdated { version: Version },
    OperationAdded { version: Version, op_id: OperationId },
    OperationUpdated { version: Version, op_id: OperationId },
    StatusChanged { version: Version, op_id: OperationId, status: OperationStatus },
    OperationRemoved { version: Version, op_id: OperationId, reason: RemovalReason },
    CacheLoaded { version: Version },
    StalenessChanged { version: Version, is_stale: bool },
}

/// The closed set of event tags, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SyncStarted,
    SyncCompleted,
    SyncError,
    GroundTruthUpdated,
    OperationAdded,
    OperationUpdated,
    StatusChanged,
    OperationRemoved,
    CacheLoaded,
    StalenessChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SyncStarted { .. } => EventKind::SyncStarted,
            Event::SyncCompleted { .. } => EventKind::SyncCompleted,
            Event::SyncError { .. } => EventKind::SyncError,
            Event::GroundTruthUpdated { .. } => EventKind::GroundTruthUpdated,
            Event::OperationAdded { .. } => EventKind::OperationAdded,
            Event::OperationUpdated { .. } => EventKind::OperationUpdated,
            Event::StatusChanged { .. } => EventKind::StatusChanged,
            Event::OperationRemoved { .. } => EventKind::OperationRemoved,
            Event::CacheLoaded { .. } => EventKind::CacheLoaded,
            Event::StalenessChanged { .. } => EventKind::StalenessChanged,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Event::SyncStarted { version }
            | Event::SyncCompleted { version }
            | Event::SyncError { version, .. }
            | Event::GroundTruthUpdated { version }
            | Event::OperationAdded { version, .. }
            | Event::OperationUpdated { version, .. }
            | Event::StatusChanged { version, .. }
            | Event::OperationRemoved { version, .. }
            | Event::CacheLoaded { version }
            | Event::StalenessChanged { version, .. } => *version,
        }
    }
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

/// Opaque handle identifying a subscription, returned by `subscribe` and
/// consumed by `unsubscribe`.
pub type SubscriptionId = u64;

struct Subscriber {
    /// `None` means "subscribed to all event types".
    kinds: Option<HashSet<EventKind>>,
    callback: Callback,
}

/// Dispatches events to registered subscribers.
///
/// Intentionally not internally synchronized: every store holds its
/// `EventBus` behind the same lock that guards its other mutable state,
/// so publish always happens with that lock already held and a second
/// lock here would be redundant.
#[derive(Default)]
pub struct EventBus {
    next_id: SubscriptionId,
    subscribers: std::collections::HashMap<SubscriptionId, Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. `kinds = None` delivers every event type.
    pub fn subscribe(
        &mut self,
        kinds: Option<HashSet<EventKind>>,
        callback: Callback,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, Subscriber { kinds, callback });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.remove(&id);
    }

    /// The union of event kinds any current subscriber wants, or `None`
    /// if at least one subscriber wants everything. Used by `LiveWrapper`
    /// to minimize what it forwards from the underlying store.
    pub fn requested_kinds(&self) -> Option<HashSet<EventKind>> {
        let mut union = HashSet::new();
        for sub in self.subscribers.values() {
            match &sub.kinds {
                None => return None,
                Some(kinds) => union.extend(kinds.iter().copied()),
            }
        }
        Some(union)
    }

    /// Deliver `event` to every matching subscriber. A panicking callback
    /// is caught and logged so it cannot take down the others.
    pub fn publish(&self, event: &Event) {
        let kind = event.kind();
        for sub in self.subscribers.values() {
            let wants = sub.kinds.as_ref().map(|k| k.contains(&kind)).unwrap_or(true);
            if !wants {
                continue;
            }
            let callback = &sub.callback;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                tracing::error!(?kind, "event subscriber callback panicked");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivers_to_all_when_unfiltered() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(None, Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.publish(&Event::SyncStarted { version: 1 });
        bus.publish(&Event::CacheLoaded { version: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn filters_by_requested_kinds() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut kinds = HashSet::new();
        kinds.insert(EventKind::SyncStarted);
        bus.subscribe(Some(kinds), Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.publish(&Event::SyncStarted { version: 1 });
        bus.publish(&Event::CacheLoaded { version: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let mut bus = EventBus::new();
        bus.subscribe(None, Box::new(|_| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(None, Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.publish(&Event::SyncStarted { version: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(None, Box::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.unsubscribe(id);
        bus.publish(&Event::SyncStarted { version: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn requested_kinds_none_if_any_subscriber_wants_all() {
        let mut bus = EventBus::new();
        let mut kinds = HashSet::new();
        kinds.insert(EventKind::SyncStarted);
        bus.subscribe(Some(kinds), Box::new(|_| {}));
        bus.subscribe(None, Box::new(|_| {}));
        assert!(bus.requested_kinds().is_none());
    }
}
