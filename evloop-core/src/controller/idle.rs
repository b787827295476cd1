//! Idle cycle: one synthetic idle notification per loop pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::app::AppContext;

/// Notification delivered to the delegate and every idle observer.
#[derive(Debug, Default)]
pub struct IdleEvent {
    cycle: u64,
    more_requested: bool,
}

impl IdleEvent {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            more_requested: false,
        }
    }

    /// Ask for another idle notification without waiting for new events.
    pub fn request_more(&mut self) {
        self.more_requested = true;
    }

    pub fn more_requested(&self) -> bool {
        self.more_requested
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

pub trait IdleObserver: Send + Sync {
    fn on_idle(&self, app: &AppContext, event: &mut IdleEvent) -> anyhow::Result<()>;
}

impl<F> IdleObserver for F
where
    F: Fn(&AppContext, &mut IdleEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_idle(&self, app: &AppContext, event: &mut IdleEvent) -> anyhow::Result<()> {
        self(app, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = SmallVec<[(ObserverId, Arc<dyn IdleObserver>); 4]>;

#[derive(Default)]
pub struct IdleDispatcher {
    observers: Mutex<ObserverList>,
    next_observer: AtomicU64,
    cycles: AtomicU64,
}

impl IdleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn IdleObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Deliver one idle notification, flush diagnostics, collect garbage.
    /// Returns whether any recipient requested more idle processing.
    pub fn run_idle_cycle(&self, app: &AppContext) -> bool {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut event = IdleEvent::new(cycle);

        app.safely_call(|| app.delegate().on_idle(app, &mut event));

        // Observers may (un)register from their callbacks.
        let observers: ObserverList = self.observers.lock().clone();
        for (_, observer) in &observers {
            app.safely_call(|| observer.on_idle(app, &mut event));
        }

        app.diagnostics().flush_active();
        let destroyed = app.destruction().collect_garbage(app);

        trace!(
            cycle,
            more = event.more_requested(),
            destroyed,
            "Idle cycle complete"
        );
        event.more_requested()
    }
}
