//! Event handlers with pending-event queues.
//!
//! The registry never owns handlers: it keeps a [`HandlerRef`] (id plus
//! `Weak`) for every handler that announced pending events, and calls back
//! into [`EventHandler::process_pending_events`] from the drain loop.
//!
//! [`QueuedHandler`] is the stock implementation: a FIFO of typed events and
//! a callback that consumes them one at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use enum_map::{Enum, EnumMap};
use parking_lot::Mutex;
use tracing::trace;

use crate::app::{AppContext, FilterResult};
use crate::fault::capture;

/// Process-unique handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Event categories used to filter a selective yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum EventCategory {
    UserInput,
    Ui,
    Socket,
    Timer,
    Thread,
    Unknown,
}

/// Set of categories allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryMask(EnumMap<EventCategory, bool>);

impl CategoryMask {
    pub fn all() -> Self {
        Self(EnumMap::from_fn(|_| true))
    }

    pub fn none() -> Self {
        Self(EnumMap::from_fn(|_| false))
    }

    pub fn only(categories: &[EventCategory]) -> Self {
        let mut mask = Self::none();
        for category in categories {
            mask.0[*category] = true;
        }
        mask
    }

    pub fn allows(&self, category: EventCategory) -> bool {
        self.0[category]
    }
}

impl Default for CategoryMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Capabilities the dispatch core needs from an event handler.
pub trait EventHandler: Send + Sync {
    fn handler_id(&self) -> HandlerId;

    /// Handler name for diagnostics.
    fn name(&self) -> &str {
        "handler"
    }

    fn has_pending_events(&self) -> bool;

    /// Process queued events. Must call
    /// [`AppContext::remove_pending_handler`] once the queue is empty, or
    /// [`AppContext::delay_pending_handler`] if nothing can run right now.
    fn process_pending_events(&self, app: &AppContext);

    /// Drop queued events without processing them.
    fn discard_pending_events(&self);
}

/// Non-owning registry entry.
#[derive(Clone)]
pub struct HandlerRef {
    pub(crate) id: HandlerId,
    pub(crate) handler: Weak<dyn EventHandler>,
}

impl HandlerRef {
    pub fn new<H: EventHandler + 'static>(handler: &Arc<H>) -> Self {
        let weak: Weak<H> = Arc::downgrade(handler);
        Self {
            id: handler.handler_id(),
            handler: weak,
        }
    }

    pub fn from_dyn(handler: &Arc<dyn EventHandler>) -> Self {
        Self {
            id: handler.handler_id(),
            handler: Arc::downgrade(handler),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.upgrade()
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef")
            .field("id", &self.id)
            .field("alive", &(self.handler.strong_count() > 0))
            .finish()
    }
}

/// Events carried by a [`QueuedHandler`].
pub trait Categorized {
    fn category(&self) -> EventCategory {
        EventCategory::Unknown
    }
}

pub type EventCallback<E> = Box<dyn Fn(&AppContext, E) -> anyhow::Result<()> + Send + Sync>;

/// Handler with an internal FIFO of events.
///
/// Lock order is queue, then registry: the queue lock is held while the
/// handler (de)registers itself so a concurrent `queue_event` cannot be lost
/// between the emptiness check and the removal.
pub struct QueuedHandler<E> {
    id: HandlerId,
    name: String,
    me: Weak<Self>,
    queue: Mutex<VecDeque<E>>,
    callback: EventCallback<E>,
}

impl<E> QueuedHandler<E>
where
    E: Categorized + Send + 'static,
{
    pub fn new<S, F>(name: S, callback: F) -> Arc<Self>
    where
        S: Into<String>,
        F: Fn(&AppContext, E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            id: HandlerId::next(),
            name,
            me: me.clone(),
            queue: Mutex::new(VecDeque::new()),
            callback: Box::new(callback),
        })
    }

    fn handler_ref(&self) -> HandlerRef {
        let weak: Weak<dyn EventHandler> = self.me.clone();
        HandlerRef {
            id: self.id,
            handler: weak,
        }
    }

    /// Queue `event` and announce this handler as having pending events.
    pub fn queue_event(&self, app: &AppContext, event: E) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(event);
            app.append_pending_handler(self.handler_ref());
        }

        app.wake_up_idle();
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop queued events and deregister, e.g. before the handler goes away.
    pub fn detach(&self, app: &AppContext) {
        let mut queue = self.queue.lock();
        queue.clear();
        app.remove_pending_handler(self.id);
    }
}

impl<E> EventHandler for QueuedHandler<E>
where
    E: Categorized + Send + 'static,
{
    fn handler_id(&self) -> HandlerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn has_pending_events(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn process_pending_events(&self, app: &AppContext) {
        let event = {
            let mut queue = self.queue.lock();

            let allowed = queue
                .iter()
                .position(|event| app.is_event_allowed(event.category()));
            let next = allowed.and_then(|index| queue.remove(index));

            match next {
                Some(event) => event,
                None if queue.is_empty() => {
                    app.remove_pending_handler(self.id);
                    return;
                }
                None => {
                    // Nothing may run inside the current selective yield.
                    trace!(handler = %self.id, queued = queue.len(), "Delaying handler");
                    app.delay_pending_handler(self.handler_ref());
                    return;
                }
            }
        };

        // An intercepted event is consumed without reaching the callback.
        if app.filter_event(event.category()) == FilterResult::Skip {
            if let Err(fault) = capture(|| (self.callback)(app, event)) {
                app.handle_fault(fault);
            }
        }

        let queue = self.queue.lock();
        if queue.is_empty() {
            app.remove_pending_handler(self.id);
        }
    }

    fn discard_pending_events(&self) {
        self.queue.lock().clear();
    }
}
