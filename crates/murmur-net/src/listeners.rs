//! Listener registrations for inbound stream events.
//!
//! Identity is per registration, not per event kind: two subscribers to the
//! same kind hold distinct [`Subscription`]s and can leave independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use murmur_shared::{EventKind, InboundEvent};
use tracing::debug;

pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Handler)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EventKind, handler: Handler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove one registration. Returns `false` if it was already gone.
    pub fn remove(&mut self, kind: EventKind, id: ListenerId) -> bool {
        let Some(list) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(&kind);
        }
        removed
    }

    pub fn contains(&self, kind: EventKind, id: ListenerId) -> bool {
        self.listeners
            .get(&kind)
            .is_some_and(|list| list.iter().any(|(lid, _)| *lid == id))
    }

    /// Snapshot of the handlers for `kind`, so they can be invoked without
    /// holding the registry lock.
    pub fn handlers_for(&self, kind: EventKind) -> Vec<Handler> {
        self.listeners
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.listeners.clear();
        dropped
    }
}

pub(crate) fn lock_registry(
    registry: &Mutex<ListenerRegistry>,
) -> MutexGuard<'_, ListenerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one registration. Dropping it (or calling
/// [`Subscription::unsubscribe`]) removes exactly that registration.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    kind: EventKind,
    id: ListenerId,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl Subscription {
    pub(crate) fn new(kind: EventKind, id: ListenerId, registry: &Arc<Mutex<ListenerRegistry>>) -> Self {
        Self {
            kind,
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether the registration is still live. A disconnect invalidates
    /// every handle.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| lock_registry(&r).contains(self.kind, self.id))
    }

    pub fn unsubscribe(self) {
        // Removal happens in Drop.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if lock_registry(&registry).remove(self.kind, self.id) {
                debug!(event = %self.kind, "Listener removed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
