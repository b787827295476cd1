//! PendingEventDispatcher: drains the handler registry once per loop iteration
//!
//! The drain always asks the *first* pending handler to process its events
//! and leaves removal to the handler itself, so handlers may re-register,
//! register others, or delay themselves while the drain is running.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, debug_span, trace};

use crate::app::AppContext;

#[derive(Debug, Default)]
pub struct PendingEventDispatcher {
    suspended: AtomicBool,
}

impl PendingEventDispatcher {
    pub fn new(start_suspended: bool) -> Self {
        Self {
            suspended: AtomicBool::new(start_suspended),
        }
    }

    /// Stop draining until [`Self::resume`]. Pending handlers stay registered.
    pub fn suspend(&self) {
        debug!("Pending event processing suspended");
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        debug!("Pending event processing resumed");
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Drain every pending handler. Returns the number of handler invocations.
    pub fn drain_all(&self, app: &AppContext) -> usize {
        if self.is_suspended() {
            trace!("Pending event processing is suspended, skipping drain");
            return 0;
        }

        let registry = app.registry();
        if registry.has_delayed() {
            app.contracts()
                .report("deferred handler set must be empty when draining pending events");
            return 0;
        }

        let _span = debug_span!("drain_pending").entered();
        let mut invocations = 0usize;

        while let Some(entry) = registry.first_pending() {
            match entry.upgrade() {
                Some(handler) => {
                    trace!(handler = %entry.id(), name = handler.name(), "Processing pending events");
                    handler.process_pending_events(app);
                    invocations += 1;
                }
                None => {
                    debug!(handler = %entry.id(), "Dropping pending entry of destroyed handler");
                    registry.remove_pending(entry.id());
                }
            }
        }

        // Handlers deferred by a selective yield get another chance next time.
        let restored = registry.restore_delayed();

        debug!(invocations, restored, "Pending events drained");
        invocations
    }

    /// Discard the events of every pending handler without processing them.
    pub fn discard_all(&self, app: &AppContext) -> usize {
        let registry = app.registry();
        if registry.has_delayed() {
            app.contracts()
                .report("deferred handler set must be empty when discarding pending events");
            return 0;
        }

        let pending = registry.take_all_pending();
        let discarded = pending.len();

        for handler in pending.iter().filter_map(|entry| entry.upgrade()) {
            handler.discard_pending_events();
        }

        debug!(discarded, "Pending events discarded");
        discarded
    }
}
