//! HandlerRegistry: handlers that currently have pending events
//!
//! Two insertion-ordered sets guarded by one lock:
//! - the pending set, drained front to back by the dispatcher
//! - the deferred set, holding handlers that asked to be skipped by the
//!   drain in progress (selective yield) and are moved back afterwards
//!
//! A handler is in at most one of the two sets. Deferred membership wins:
//! appending a deferred handler is a no-op until the drain restores it.
//! The lock covers set mutation only and is never held across a call into a
//! handler.

use std::sync::Weak;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use super::handler::{EventHandler, HandlerId, HandlerRef};

type HandlerSet = IndexMap<HandlerId, Weak<dyn EventHandler>>;

#[derive(Default)]
struct RegistryState {
    pending: HandlerSet,
    delayed: HandlerSet,
}

#[derive(Default)]
pub struct HandlerRegistry {
    state: Mutex<RegistryState>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler` to the pending set. Returns `false` if it was already
    /// pending or deferred.
    pub fn append_pending(&self, handler: HandlerRef) -> bool {
        let mut state = self.state.lock();

        if state.pending.contains_key(&handler.id) || state.delayed.contains_key(&handler.id) {
            return false;
        }

        debug!(handler = %handler.id, "Handler has pending events");
        state.pending.insert(handler.id, handler.handler);
        true
    }

    /// Remove `id` from both sets. Idempotent.
    pub fn remove_pending(&self, id: HandlerId) -> bool {
        let mut state = self.state.lock();

        let was_pending = state.pending.shift_remove(&id).is_some();
        let was_delayed = state.delayed.shift_remove(&id).is_some();

        if was_pending || was_delayed {
            debug!(handler = %id, "Handler no longer pending");
        }

        was_pending || was_delayed
    }

    /// Move `handler` from the pending set to the deferred set.
    pub fn delay_pending(&self, handler: HandlerRef) {
        let mut state = self.state.lock();

        state.pending.shift_remove(&handler.id);
        if !state.delayed.contains_key(&handler.id) {
            debug!(handler = %handler.id, "Handler deferred");
            state.delayed.insert(handler.id, handler.handler);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn delayed_count(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub fn is_pending(&self, id: HandlerId) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    pub fn is_delayed(&self, id: HandlerId) -> bool {
        self.state.lock().delayed.contains_key(&id)
    }

    /// Pending handler ids in drain order.
    pub fn pending_ids(&self) -> Vec<HandlerId> {
        self.state.lock().pending.keys().copied().collect()
    }

    pub(crate) fn has_delayed(&self) -> bool {
        !self.state.lock().delayed.is_empty()
    }

    /// Head of the pending set, left in place.
    pub(crate) fn first_pending(&self) -> Option<HandlerRef> {
        self.state
            .lock()
            .pending
            .get_index(0)
            .map(|(id, handler)| HandlerRef {
                id: *id,
                handler: handler.clone(),
            })
    }

    /// Append every deferred handler to the pending set and clear the
    /// deferred set. Returns how many were moved.
    pub(crate) fn restore_delayed(&self) -> usize {
        let mut state = self.state.lock();

        let delayed = std::mem::take(&mut state.delayed);
        let moved = delayed.len();
        for (id, handler) in delayed {
            state.pending.entry(id).or_insert(handler);
        }

        moved
    }

    /// Empty the pending set, returning its former contents in order.
    pub(crate) fn take_all_pending(&self) -> Vec<HandlerRef> {
        let pending = std::mem::take(&mut self.state.lock().pending);

        pending
            .into_iter()
            .map(|(id, handler)| HandlerRef { id, handler })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppContext;
    use std::sync::Arc;

    struct Idle {
        id: HandlerId,
    }

    impl Idle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: HandlerId::next(),
            })
        }
    }

    impl EventHandler for Idle {
        fn handler_id(&self) -> HandlerId {
            self.id
        }

        fn has_pending_events(&self) -> bool {
            false
        }

        fn process_pending_events(&self, _app: &AppContext) {}

        fn discard_pending_events(&self) {}
    }

    #[test]
    fn test_append_is_idempotent() {
        let registry = HandlerRegistry::new();
        let a = Idle::new();

        assert!(registry.append_pending(HandlerRef::new(&a)));
        assert!(!registry.append_pending(HandlerRef::new(&a)));
        assert!(!registry.append_pending(HandlerRef::new(&a)));

        assert_eq!(registry.pending_count(), 1);
        assert!(registry.has_pending());
    }

    #[test]
    fn test_has_pending_tracks_append_remove_sequences() {
        let registry = HandlerRegistry::new();
        let handlers: Vec<_> = (0..4).map(|_| Idle::new()).collect();

        for h in &handlers {
            registry.append_pending(HandlerRef::new(h));
        }
        assert_eq!(registry.pending_count(), 4);

        for (i, h) in handlers.iter().enumerate() {
            assert!(registry.remove_pending(h.id));
            assert!(!registry.remove_pending(h.id));
            assert_eq!(registry.has_pending(), i + 1 < handlers.len());
        }

        registry.append_pending(HandlerRef::new(&handlers[2]));
        assert!(registry.has_pending());
        assert_eq!(registry.pending_ids(), vec![handlers[2].id]);
    }

    #[test]
    fn test_order_is_registration_order() {
        let registry = HandlerRegistry::new();
        let (a, b, c) = (Idle::new(), Idle::new(), Idle::new());

        registry.append_pending(HandlerRef::new(&b));
        registry.append_pending(HandlerRef::new(&a));
        registry.append_pending(HandlerRef::new(&c));
        assert_eq!(registry.pending_ids(), vec![b.id, a.id, c.id]);

        // Re-registration after removal goes to the back.
        registry.remove_pending(b.id);
        registry.append_pending(HandlerRef::new(&b));
        assert_eq!(registry.pending_ids(), vec![a.id, c.id, b.id]);
        assert_eq!(registry.first_pending().map(|h| h.id()), Some(a.id));
    }

    #[test]
    fn test_delay_moves_between_sets() {
        let registry = HandlerRegistry::new();
        let a = Idle::new();
        registry.append_pending(HandlerRef::new(&a));

        registry.delay_pending(HandlerRef::new(&a));
        registry.delay_pending(HandlerRef::new(&a));

        assert!(!registry.is_pending(a.id));
        assert!(registry.is_delayed(a.id));
        assert_eq!(registry.delayed_count(), 1);
        assert!(!registry.has_pending());
    }

    #[test]
    fn test_append_of_delayed_handler_is_noop() {
        let registry = HandlerRegistry::new();
        let a = Idle::new();
        registry.delay_pending(HandlerRef::new(&a));

        assert!(!registry.append_pending(HandlerRef::new(&a)));
        assert!(!registry.is_pending(a.id));
        assert!(registry.is_delayed(a.id));
    }

    #[test]
    fn test_remove_clears_both_sets() {
        let registry = HandlerRegistry::new();
        let (a, b) = (Idle::new(), Idle::new());
        registry.append_pending(HandlerRef::new(&a));
        registry.delay_pending(HandlerRef::new(&b));

        assert!(registry.remove_pending(a.id));
        assert!(registry.remove_pending(b.id));
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.delayed_count(), 0);
    }

    #[test]
    fn test_restore_delayed_appends_after_pending() {
        let registry = HandlerRegistry::new();
        let (a, b, c) = (Idle::new(), Idle::new(), Idle::new());
        registry.append_pending(HandlerRef::new(&a));
        registry.append_pending(HandlerRef::new(&b));
        registry.delay_pending(HandlerRef::new(&a));
        registry.append_pending(HandlerRef::new(&c));

        assert_eq!(registry.restore_delayed(), 1);
        assert!(!registry.has_delayed());
        assert_eq!(registry.pending_ids(), vec![b.id, c.id, a.id]);
    }

    #[test]
    fn test_take_all_pending_empties_set() {
        let registry = HandlerRegistry::new();
        let (a, b) = (Idle::new(), Idle::new());
        registry.append_pending(HandlerRef::new(&a));
        registry.append_pending(HandlerRef::new(&b));

        let taken: Vec<_> = registry.take_all_pending().iter().map(|h| h.id()).collect();

        assert_eq!(taken, vec![a.id, b.id]);
        assert!(!registry.has_pending());
    }
}
