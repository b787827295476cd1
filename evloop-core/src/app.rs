//! AppContext: the application root owning every dispatch component
//!
//! There is no process-wide singleton: each `AppContext` has its own handler
//! registry, deferred destruction queue and main loop association, and is
//! passed by reference into every callback.
//!
//! ```rust,ignore
//! let app = AppContext::builder().config(config).build();
//! let code = app.main_loop();
//! app.on_exit();
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::config::Config;
use crate::controller::cooperative::CooperativeFactory;
use crate::controller::destruction::{DeferredDestructionQueue, Disposable};
use crate::controller::dispatcher::PendingEventDispatcher;
use crate::controller::handler::{CategoryMask, EventCategory, HandlerId, HandlerRef};
use crate::controller::idle::{IdleDispatcher, IdleEvent, IdleObserver, ObserverId};
use crate::controller::main_loop::{LoopFactory, MainLoopOwner};
use crate::controller::registry::HandlerRegistry;
use crate::error::AppResult;
use crate::fault::{ContractMonitor, Fault, FaultSlot, capture, report_unhandled};
use crate::logging::{BufferedLog, DiagnosticSink};

/// What [`AppDelegate::filter_event`] decided for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterResult {
    /// Not intercepted: deliver the event to its handler.
    #[default]
    Skip,
    /// Handled by the filter itself.
    Processed,
    /// Dropped without processing.
    Ignored,
}

/// Application-level hooks. Every method has a default.
pub trait AppDelegate: Send + Sync {
    /// Sees every event before its handler runs. Anything but
    /// [`FilterResult::Skip`] consumes the event.
    fn filter_event(&self, _app: &AppContext, _category: EventCategory) -> FilterResult {
        FilterResult::Skip
    }

    /// Called right before the main loop starts running.
    fn on_launched(&self, _app: &AppContext) {}

    /// Receives the idle notification before any idle observer.
    fn on_idle(&self, _app: &AppContext, _event: &mut IdleEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// A callback fault reached the dispatch boundary.
    fn on_unhandled_fault(&self, _app: &AppContext, fault: &Fault) {
        report_unhandled(fault);
    }
}

#[derive(Debug, Default)]
pub struct DefaultDelegate;

impl AppDelegate for DefaultDelegate {}

pub struct AppContext {
    config: Config,
    registry: HandlerRegistry,
    dispatcher: PendingEventDispatcher,
    idle: IdleDispatcher,
    destruction: DeferredDestructionQueue,
    loops: MainLoopOwner,
    delegate: Arc<dyn AppDelegate>,
    diagnostics: Arc<dyn DiagnosticSink>,
    faults: FaultSlot,
    contracts: ContractMonitor,
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &PendingEventDispatcher {
        &self.dispatcher
    }

    pub fn idle(&self) -> &IdleDispatcher {
        &self.idle
    }

    pub fn destruction(&self) -> &DeferredDestructionQueue {
        &self.destruction
    }

    pub fn loops(&self) -> &MainLoopOwner {
        &self.loops
    }

    pub fn delegate(&self) -> &dyn AppDelegate {
        self.delegate.as_ref()
    }

    pub fn diagnostics(&self) -> &dyn DiagnosticSink {
        self.diagnostics.as_ref()
    }

    pub fn contracts(&self) -> &ContractMonitor {
        &self.contracts
    }

    // ---- pending handlers ----

    pub fn append_pending_handler(&self, handler: HandlerRef) -> bool {
        self.registry.append_pending(handler)
    }

    pub fn remove_pending_handler(&self, id: HandlerId) -> bool {
        self.registry.remove_pending(id)
    }

    pub fn delay_pending_handler(&self, handler: HandlerRef) {
        self.registry.delay_pending(handler);
    }

    pub fn has_pending_events(&self) -> bool {
        self.registry.has_pending()
    }

    pub fn process_pending_events(&self) -> usize {
        self.dispatcher.drain_all(self)
    }

    pub fn discard_pending_events(&self) -> usize {
        self.dispatcher.discard_all(self)
    }

    pub fn suspend_processing_of_pending_events(&self) {
        self.dispatcher.suspend();
    }

    pub fn resume_processing_of_pending_events(&self) {
        self.dispatcher.resume();
    }

    // ---- idle ----

    pub fn add_idle_observer(&self, observer: Arc<dyn IdleObserver>) -> ObserverId {
        self.idle.add_observer(observer)
    }

    pub fn remove_idle_observer(&self, id: ObserverId) -> bool {
        self.idle.remove_observer(id)
    }

    /// Run one idle cycle; `true` if more idle processing was requested.
    pub fn process_idle(&self) -> bool {
        self.idle.run_idle_cycle(self)
    }

    // ---- deferred destruction ----

    pub fn schedule_for_destruction(&self, object: Arc<dyn Disposable>) -> bool {
        self.destruction.schedule(self, object)
    }

    pub fn is_scheduled_for_destruction(&self, object: &Arc<dyn Disposable>) -> bool {
        self.destruction.is_scheduled(object)
    }

    pub fn delete_pending_objects(&self) -> usize {
        self.destruction.collect_garbage(self)
    }

    // ---- loops ----

    /// Create and run the main loop, returning its exit code.
    pub fn main_loop(&self) -> i32 {
        self.loops.run(self)
    }

    pub fn exit_main_loop(&self) {
        self.loops.exit_main_loop();
    }

    /// Stop the main loop, or terminate the process if none exists.
    pub fn exit(&self) {
        self.loops.request_exit();
    }

    pub fn pending(&self) -> bool {
        self.loops.pending()
    }

    pub fn dispatch(&self) -> bool {
        self.loops.dispatch_one(self)
    }

    pub fn yield_now(&self, only_if_needed: bool) -> bool {
        self.loops.yield_now(self, only_if_needed)
    }

    /// Yield processing only events of the `allowed` categories.
    pub fn yield_for(&self, allowed: CategoryMask) -> bool {
        self.loops.yield_for(self, allowed, false)
    }

    pub fn wake_up_idle(&self) {
        self.loops.wake_up();
    }

    pub fn is_main_loop_running(&self) -> bool {
        self.loops.is_main_loop_running()
    }

    /// Whether some loop is active, so deferred work will be picked up.
    pub fn uses_event_loop(&self) -> bool {
        self.loops.has_active()
    }

    pub fn is_event_allowed(&self, category: EventCategory) -> bool {
        self.loops.is_event_allowed(category)
    }

    /// Ask the delegate whether an event of `category` should be delivered.
    /// A panicking filter is routed as a fault and the event is delivered.
    pub fn filter_event(&self, category: EventCategory) -> FilterResult {
        let filter = AssertUnwindSafe(|| self.delegate.filter_event(self, category));
        match catch_unwind(filter) {
            Ok(FilterResult::Skip) => FilterResult::Skip,
            Ok(result) => {
                trace!(?category, ?result, "Event intercepted by filter");
                result
            }
            Err(payload) => {
                self.handle_fault(Fault::from_panic(payload));
                FilterResult::Skip
            }
        }
    }

    /// Final cleanup after the main loop returned.
    pub fn on_exit(&self) -> i32 {
        let collected = self.delete_pending_objects();
        info!(collected, "Application exiting");
        0
    }

    // ---- faults ----

    /// Run `f` at the dispatch boundary. Returns `false` if it faulted.
    pub fn safely_call<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        match capture(f) {
            Ok(()) => true,
            Err(fault) => {
                self.handle_fault(fault);
                false
            }
        }
    }

    /// Route `fault` to the delegate, falling back to the default report if
    /// the delegate itself panics.
    pub fn handle_fault(&self, fault: Fault) {
        debug!("Routing {fault} to the unhandled fault hook");

        let notify = AssertUnwindSafe(|| self.delegate.on_unhandled_fault(self, &fault));
        if catch_unwind(notify).is_err() {
            report_unhandled(&fault);
        }
    }

    /// Keep `fault` for a later [`Self::rethrow_stored_fault`].
    pub fn store_fault(&self, fault: Fault) -> bool {
        self.faults.store(fault)
    }

    pub fn rethrow_stored_fault(&self) -> AppResult<()> {
        self.faults.rethrow()
    }
}

pub struct AppContextBuilder {
    config: Config,
    delegate: Arc<dyn AppDelegate>,
    diagnostics: Arc<dyn DiagnosticSink>,
    factory: Arc<dyn LoopFactory>,
}

impl AppContextBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            delegate: Arc::new(DefaultDelegate),
            diagnostics: Arc::new(BufferedLog::new()),
            factory: Arc::new(CooperativeFactory),
        }
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn delegate(mut self, delegate: Arc<dyn AppDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    #[must_use]
    pub fn loop_factory(mut self, factory: Arc<dyn LoopFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn build(self) -> Arc<AppContext> {
        let loops = MainLoopOwner::new(self.factory, self.config.main_loop.clone());
        let dispatcher = PendingEventDispatcher::new(self.config.dispatch.start_suspended);
        let contracts = ContractMonitor::new(self.config.contracts.panic_on_violation);

        Arc::new(AppContext {
            config: self.config,
            registry: HandlerRegistry::new(),
            dispatcher,
            idle: IdleDispatcher::new(),
            destruction: DeferredDestructionQueue::new(),
            loops,
            delegate: self.delegate,
            diagnostics: self.diagnostics,
            faults: FaultSlot::new(),
            contracts,
        })
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cooperative::CooperativeLoop;
    use crate::controller::handler::{Categorized, QueuedHandler};
    use crate::controller::main_loop::{ActiveLoopGuard, EventLoop};
    use crate::error::AppError;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn cooperative() -> Arc<dyn EventLoop> {
        Arc::new(CooperativeLoop::new(Duration::from_millis(1)))
    }

    #[derive(Default)]
    struct RecordingDelegate {
        faults: Mutex<Vec<String>>,
        idles: Mutex<u32>,
    }

    impl AppDelegate for RecordingDelegate {
        fn on_idle(&self, _app: &AppContext, _event: &mut IdleEvent) -> anyhow::Result<()> {
            *self.idles.lock() += 1;
            Ok(())
        }

        fn on_unhandled_fault(&self, _app: &AppContext, fault: &Fault) {
            self.faults.lock().push(fault.to_string());
        }
    }

    struct Job;

    impl Categorized for Job {}

    #[test]
    fn test_scenario_two_handlers_drained() {
        let app = AppContext::builder().build();
        let a = QueuedHandler::new("a", |_app: &AppContext, _job: Job| Ok(()));
        let b = QueuedHandler::new("b", |_app: &AppContext, _job: Job| Ok(()));

        a.queue_event(&app, Job);
        b.queue_event(&app, Job);
        assert!(app.has_pending_events());

        app.process_pending_events();

        assert_eq!(a.queued(), 0);
        assert_eq!(b.queued(), 0);
        assert!(!app.has_pending_events());
    }

    #[test]
    fn test_handler_faults_reach_delegate() {
        let delegate = Arc::new(RecordingDelegate::default());
        let app = AppContext::builder().delegate(delegate.clone()).build();
        let handler = QueuedHandler::new("faulty", |_app: &AppContext, _job: Job| {
            panic!("handler exploded")
        });

        handler.queue_event(&app, Job);
        app.process_pending_events();

        let faults = delegate.faults.lock();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("handler exploded"));
    }

    #[test]
    fn test_delegate_receives_idle_first() {
        let delegate = Arc::new(RecordingDelegate::default());
        let app = AppContext::builder().delegate(delegate.clone()).build();

        app.process_idle();
        app.process_idle();

        assert_eq!(*delegate.idles.lock(), 2);
    }

    struct PanickingDelegate;

    impl AppDelegate for PanickingDelegate {
        fn on_unhandled_fault(&self, _app: &AppContext, _fault: &Fault) {
            panic!("fault hook failed");
        }
    }

    #[test]
    fn test_panicking_fault_hook_is_contained() {
        let app = AppContext::builder()
            .delegate(Arc::new(PanickingDelegate))
            .build();

        assert!(!app.safely_call(|| anyhow::bail!("first failure")));
        assert!(app.safely_call(|| Ok(())));
    }

    #[test]
    fn test_store_and_rethrow_fault() {
        let app = AppContext::builder().build();

        assert!(app.store_fault(Fault::Panic {
            message: "deferred".into()
        }));

        assert!(matches!(
            app.rethrow_stored_fault(),
            Err(AppError::StoredFault(_))
        ));
        assert!(app.rethrow_stored_fault().is_ok());
    }

    #[test]
    fn test_on_exit_collects_garbage() {
        struct Flag(Mutex<bool>);

        impl Disposable for Flag {
            fn dispose(&self, _app: &AppContext) {
                *self.0.lock() = true;
            }
        }

        let app = AppContext::builder().build();
        let flag = Arc::new(Flag(Mutex::new(false)));

        {
            let _active = ActiveLoopGuard::activate(app.loops(), cooperative());
            assert!(app.schedule_for_destruction(flag.clone()));
        }
        assert!(!*flag.0.lock());

        assert_eq!(app.on_exit(), 0);
        assert!(*flag.0.lock());
    }

    #[test]
    fn test_double_schedule_from_handler_destroys_once() {
        struct Counted(Mutex<u32>);

        impl Disposable for Counted {
            fn dispose(&self, _app: &AppContext) {
                *self.0.lock() += 1;
            }
        }

        let app = AppContext::builder().build();
        let x = Arc::new(Counted(Mutex::new(0)));
        let target: Arc<dyn Disposable> = x.clone();
        let handler = QueuedHandler::new("a", move |app: &AppContext, _job: Job| {
            app.schedule_for_destruction(target.clone());
            app.schedule_for_destruction(target.clone());
            Ok(())
        });
        let _active = ActiveLoopGuard::activate(app.loops(), cooperative());

        handler.queue_event(&app, Job);
        app.process_pending_events();
        assert_eq!(*x.0.lock(), 0);

        assert_eq!(app.delete_pending_objects(), 1);
        assert_eq!(*x.0.lock(), 1);
    }

    struct Alarm(EventCategory);

    impl Categorized for Alarm {
        fn category(&self) -> EventCategory {
            self.0
        }
    }

    /// Consumes every timer event with a fixed result.
    struct TimerFilter {
        result: FilterResult,
        seen: Mutex<Vec<EventCategory>>,
    }

    impl AppDelegate for TimerFilter {
        fn filter_event(&self, _app: &AppContext, category: EventCategory) -> FilterResult {
            self.seen.lock().push(category);
            match category {
                EventCategory::Timer => self.result,
                _ => FilterResult::Skip,
            }
        }
    }

    fn filtered_handler_run(result: FilterResult) {
        let delegate = Arc::new(TimerFilter {
            result,
            seen: Mutex::new(Vec::new()),
        });
        let app = AppContext::builder().delegate(delegate.clone()).build();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let log = delivered.clone();
        let handler = QueuedHandler::new("alarms", move |_app: &AppContext, alarm: Alarm| {
            log.lock().push(alarm.0);
            Ok(())
        });
        handler.queue_event(&app, Alarm(EventCategory::Timer));
        handler.queue_event(&app, Alarm(EventCategory::Ui));

        app.process_pending_events();

        assert_eq!(*delivered.lock(), vec![EventCategory::Ui]);
        assert_eq!(
            *delegate.seen.lock(),
            vec![EventCategory::Timer, EventCategory::Ui]
        );
        assert_eq!(handler.queued(), 0);
        assert!(!app.has_pending_events());
    }

    #[test]
    fn test_processed_filter_result_consumes_event() {
        filtered_handler_run(FilterResult::Processed);
    }

    #[test]
    fn test_ignored_filter_result_consumes_event() {
        filtered_handler_run(FilterResult::Ignored);
    }

    #[test]
    fn test_panicking_filter_delivers_event() {
        struct BrokenFilter;

        impl AppDelegate for BrokenFilter {
            fn filter_event(&self, _app: &AppContext, _category: EventCategory) -> FilterResult {
                panic!("filter failed")
            }
        }

        let app = AppContext::builder().delegate(Arc::new(BrokenFilter)).build();

        assert_eq!(app.filter_event(EventCategory::Ui), FilterResult::Skip);
    }

    #[test]
    fn test_contexts_are_independent() {
        let first = AppContext::builder().build();
        let second = AppContext::builder().build();
        let handler = QueuedHandler::new("solo", |_app: &AppContext, _job: Job| Ok(()));

        handler.queue_event(&first, Job);

        assert!(first.has_pending_events());
        assert!(!second.has_pending_events());
    }
}
