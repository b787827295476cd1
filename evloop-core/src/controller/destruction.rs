//! Deferred destruction of objects that may still be referenced by the
//! current call stack.
//!
//! Objects are disposed from the idle cycle (or on exit), never from inside
//! the callback that scheduled them. Disposal may schedule further objects or
//! run a nested collection; the queue lock is released around every
//! `dispose` call and the head of the list is re-read after each one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::app::AppContext;

/// Teardown hook run once, when the object is collected.
pub trait Disposable: Send + Sync {
    fn dispose(&self, app: &AppContext);
}

type ObjectKey = usize;

fn key_of(object: &Arc<dyn Disposable>) -> ObjectKey {
    Arc::as_ptr(object) as *const () as usize
}

#[derive(Default)]
struct QueueState {
    scheduled: IndexMap<ObjectKey, Arc<dyn Disposable>>,
    // Objects whose `dispose` is running; rescheduling them is ignored.
    disposing: IndexSet<ObjectKey>,
}

#[derive(Default)]
pub struct DeferredDestructionQueue {
    state: Mutex<QueueState>,
    destroyed: AtomicU64,
}

impl DeferredDestructionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `object` for disposal at the next idle point.
    ///
    /// With no active loop there is no next idle point, so the object is
    /// disposed right away. Returns `true` if the object was deferred.
    pub fn schedule(&self, app: &AppContext, object: Arc<dyn Disposable>) -> bool {
        let key = key_of(&object);

        if !app.uses_event_loop() {
            {
                let mut state = self.state.lock();
                if state.disposing.contains(&key) {
                    return false;
                }
                // An entry left from an earlier loop must not be collected again.
                state.scheduled.shift_remove(&key);
            }
            trace!(object = key, "No active loop, disposing immediately");
            self.destroy(app, key, object);
            return false;
        }

        let mut state = self.state.lock();
        if state.disposing.contains(&key) {
            return false;
        }
        if !state.scheduled.contains_key(&key) {
            trace!(object = key, "Scheduled for destruction");
            state.scheduled.insert(key, object);
        }
        true
    }

    pub fn is_scheduled(&self, object: &Arc<dyn Disposable>) -> bool {
        self.state.lock().scheduled.contains_key(&key_of(object))
    }

    /// Drop `object` from the queue without disposing it.
    pub fn unschedule(&self, object: &Arc<dyn Disposable>) -> bool {
        self.state
            .lock()
            .scheduled
            .shift_remove(&key_of(object))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total objects disposed through this queue.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Dispose every scheduled object, including ones scheduled while this
    /// collection is running. Returns the number disposed.
    pub fn collect_garbage(&self, app: &AppContext) -> usize {
        let mut collected = 0;

        loop {
            let next = self.state.lock().scheduled.shift_remove_index(0);
            let Some((key, object)) = next else {
                break;
            };

            self.destroy(app, key, object);
            collected += 1;
        }

        if collected > 0 {
            debug!(collected, "Collected objects scheduled for destruction");
        }
        collected
    }

    fn destroy(&self, app: &AppContext, key: ObjectKey, object: Arc<dyn Disposable>) {
        self.state.lock().disposing.insert(key);

        // Clears the in-flight mark even if `dispose` unwinds.
        let _done = DisposeGuard { queue: self, key };
        object.dispose(app);
        drop(object);

        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

struct DisposeGuard<'a> {
    queue: &'a DeferredDestructionQueue,
    key: ObjectKey,
}

impl Drop for DisposeGuard<'_> {
    fn drop(&mut self) {
        self.queue.state.lock().disposing.shift_remove(&self.key);
    }
}
