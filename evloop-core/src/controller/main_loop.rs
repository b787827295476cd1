//! Main loop ownership and forwarding to the active loop.
//!
//! Two distinct notions:
//! - the *main* loop, created by [`MainLoopOwner::run`] and the only loop
//!   [`MainLoopOwner::exit_main_loop`] stops
//! - the *active* loop, the innermost loop currently running (a nested modal
//!   loop, for instance), which `pending`/`dispatch`/`yield` forward to
//!
//! Both associations are held by scoped guards, so they are cleared even if a
//! loop's `run` unwinds.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::app::AppContext;
use crate::config::MainLoopConfig;
use crate::error::{AppError, AppResult};

use super::handler::{CategoryMask, EventCategory};

/// A run loop driving event dispatch.
pub trait EventLoop: Send + Sync {
    /// Run until [`EventLoop::exit`] is called; returns the exit code.
    fn run(&self, app: &AppContext) -> i32;

    /// Ask the loop to stop. Advisory: takes effect at the next check.
    fn exit(&self, code: i32);

    fn is_running(&self) -> bool;

    /// Whether posted work is waiting.
    fn pending(&self) -> bool;

    /// Dispatch one unit of posted work, waiting for it if necessary.
    /// Returns `false` once the loop should exit.
    fn dispatch(&self, app: &AppContext) -> bool;

    /// Process queued work of the allowed categories without blocking.
    fn yield_for(&self, app: &AppContext, allowed: CategoryMask, only_if_needed: bool) -> bool;

    fn yield_now(&self, app: &AppContext, only_if_needed: bool) -> bool {
        self.yield_for(app, CategoryMask::all(), only_if_needed)
    }

    /// Whether an event of `category` may run right now.
    fn is_event_allowed(&self, _category: EventCategory) -> bool {
        true
    }

    /// Wake the loop if it is blocked waiting for work.
    fn wake_up(&self);
}

pub trait LoopFactory: Send + Sync {
    fn create_loop(&self, config: &MainLoopConfig) -> Option<Arc<dyn EventLoop>>;
}

pub struct MainLoopOwner {
    factory: Arc<dyn LoopFactory>,
    config: MainLoopConfig,
    main: Mutex<Option<Arc<dyn EventLoop>>>,
    active: Mutex<Vec<Arc<dyn EventLoop>>>,
}

impl MainLoopOwner {
    pub fn new(factory: Arc<dyn LoopFactory>, config: MainLoopConfig) -> Self {
        Self {
            factory,
            config,
            main: Mutex::new(None),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Create the main loop, announce launch, and run it.
    ///
    /// Returns the loop's exit code, or the configured failure code if the
    /// factory produced no loop.
    pub fn run(&self, app: &AppContext) -> i32 {
        let main = match self.create_loop() {
            Ok(main) => main,
            Err(e) => {
                warn!("No main loop: {e}");
                return self.config.failure_exit_code;
            }
        };

        let _main = MainLoopGuard::install(self, main.clone());
        app.delegate().on_launched(app);

        info!("Entering main loop");
        let code = self.enter(app, &main);
        info!(code, "Main loop finished");

        code
    }

    /// New loop from the factory, e.g. for a nested modal run via [`Self::enter`].
    pub fn create_loop(&self) -> AppResult<Arc<dyn EventLoop>> {
        self.factory
            .create_loop(&self.config)
            .ok_or(AppError::LoopCreation)
    }

    /// Run `event_loop` as the active loop until it exits.
    pub fn enter(&self, app: &AppContext, event_loop: &Arc<dyn EventLoop>) -> i32 {
        let _active = ActiveLoopGuard::activate(self, event_loop.clone());
        event_loop.run(app)
    }

    /// Stop the main loop (not a nested one) if it is running.
    pub fn exit_main_loop(&self) {
        let main = self.main.lock().clone();
        if let Some(main) = main.filter(|l| l.is_running()) {
            debug!("Requesting main loop exit");
            main.exit(0);
        }
    }

    /// Stop the main loop, or terminate the process if there is none.
    pub fn request_exit(&self) {
        if self.main.lock().is_some() {
            self.exit_main_loop();
        } else {
            warn!("Exit requested without a main loop, terminating");
            std::process::exit(self.config.failure_exit_code);
        }
    }

    pub fn main_loop(&self) -> Option<Arc<dyn EventLoop>> {
        self.main.lock().clone()
    }

    pub fn is_main_loop_running(&self) -> bool {
        self.main.lock().is_some()
    }

    /// Innermost running loop.
    pub fn active(&self) -> Option<Arc<dyn EventLoop>> {
        self.active.lock().last().cloned()
    }

    pub fn has_active(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn pending(&self) -> bool {
        self.active().is_some_and(|l| l.pending())
    }

    pub fn dispatch_one(&self, app: &AppContext) -> bool {
        self.active().is_some_and(|l| l.dispatch(app))
    }

    pub fn yield_now(&self, app: &AppContext, only_if_needed: bool) -> bool {
        self.yield_for(app, CategoryMask::all(), only_if_needed)
    }

    /// Yield on the active loop, or on a temporary one if none is running.
    pub fn yield_for(&self, app: &AppContext, allowed: CategoryMask, only_if_needed: bool) -> bool {
        if let Some(active) = self.active() {
            return active.yield_for(app, allowed, only_if_needed);
        }

        match self.create_loop() {
            Ok(temporary) => {
                debug!("Yielding on a temporary loop");
                let _active = ActiveLoopGuard::activate(self, temporary.clone());
                temporary.yield_for(app, allowed, only_if_needed)
            }
            Err(e) => {
                debug!("Cannot yield: {e}");
                false
            }
        }
    }

    pub fn is_event_allowed(&self, category: EventCategory) -> bool {
        self.active().is_none_or(|l| l.is_event_allowed(category))
    }

    pub fn wake_up(&self) {
        if let Some(active) = self.active() {
            active.wake_up();
        }
    }
}

/// Associates a loop with [`MainLoopOwner`] as the main loop for its scope,
/// restoring the previous association on drop.
pub struct MainLoopGuard<'a> {
    owner: &'a MainLoopOwner,
    previous: Option<Arc<dyn EventLoop>>,
}

impl<'a> MainLoopGuard<'a> {
    pub fn install(owner: &'a MainLoopOwner, main: Arc<dyn EventLoop>) -> Self {
        let previous = owner.main.lock().replace(main);
        Self { owner, previous }
    }
}

impl Drop for MainLoopGuard<'_> {
    fn drop(&mut self) {
        *self.owner.main.lock() = self.previous.take();
    }
}

/// Pushes a loop on the active stack for its scope.
pub struct ActiveLoopGuard<'a> {
    owner: &'a MainLoopOwner,
    event_loop: Arc<dyn EventLoop>,
}

impl<'a> ActiveLoopGuard<'a> {
    pub fn activate(owner: &'a MainLoopOwner, event_loop: Arc<dyn EventLoop>) -> Self {
        owner.active.lock().push(event_loop.clone());
        Self { owner, event_loop }
    }
}

impl Drop for ActiveLoopGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.owner.active.lock();
        if let Some(pos) = active
            .iter()
            .rposition(|l| Arc::ptr_eq(l, &self.event_loop))
        {
            active.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppDelegate;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

    /// Loop that records calls and exits as soon as it is run.
    #[derive(Default)]
    struct ScriptedLoop {
        running: AtomicBool,
        exit_code: AtomicI32,
        yields: AtomicU32,
        saw_main: AtomicBool,
    }

    impl EventLoop for ScriptedLoop {
        fn run(&self, app: &AppContext) -> i32 {
            self.running.store(true, Ordering::SeqCst);
            self.saw_main
                .store(app.is_main_loop_running(), Ordering::SeqCst);
            app.exit_main_loop();
            self.running.store(false, Ordering::SeqCst);
            self.exit_code.load(Ordering::SeqCst)
        }

        fn exit(&self, code: i32) {
            self.exit_code.store(code + 42, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn pending(&self) -> bool {
            true
        }

        fn dispatch(&self, _app: &AppContext) -> bool {
            true
        }

        fn yield_for(&self, _app: &AppContext, _allowed: CategoryMask, _only: bool) -> bool {
            self.yields.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn wake_up(&self) {}
    }

    struct ScriptedFactory {
        created: Mutex<Vec<Arc<ScriptedLoop>>>,
        enabled: bool,
    }

    impl ScriptedFactory {
        fn new(enabled: bool) -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
                enabled,
            })
        }
    }

    impl LoopFactory for ScriptedFactory {
        fn create_loop(&self, _config: &MainLoopConfig) -> Option<Arc<dyn EventLoop>> {
            if !self.enabled {
                return None;
            }
            let event_loop = Arc::new(ScriptedLoop::default());
            self.created.lock().push(event_loop.clone());
            Some(event_loop)
        }
    }

    #[derive(Default)]
    struct LaunchDelegate {
        launched: AtomicBool,
    }

    impl AppDelegate for LaunchDelegate {
        fn on_launched(&self, app: &AppContext) {
            assert!(app.is_main_loop_running());
            assert!(!app.uses_event_loop());
            self.launched.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_returns_loop_exit_code_and_clears_main() {
        let factory = ScriptedFactory::new(true);
        let delegate = Arc::new(LaunchDelegate::default());
        let app = AppContext::builder()
            .loop_factory(factory.clone())
            .delegate(delegate.clone())
            .build();

        assert_eq!(app.main_loop(), 42);

        assert!(delegate.launched.load(Ordering::SeqCst));
        assert!(factory.created.lock()[0].saw_main.load(Ordering::SeqCst));
        assert!(!app.is_main_loop_running());
        assert!(!app.uses_event_loop());
    }

    #[test]
    fn test_run_without_loop_returns_failure_code() {
        let app = AppContext::builder()
            .loop_factory(ScriptedFactory::new(false))
            .build();

        assert_eq!(app.main_loop(), -1);
    }

    #[test]
    fn test_exit_main_loop_ignores_idle_main() {
        let factory = ScriptedFactory::new(true);
        let app = AppContext::builder().loop_factory(factory.clone()).build();
        let main: Arc<dyn EventLoop> = Arc::new(ScriptedLoop::default());

        let _guard = MainLoopGuard::install(app.loops(), main);
        app.exit_main_loop();

        assert!(app.is_main_loop_running());
    }

    #[test]
    fn test_forwarding_targets_innermost_loop() {
        let app = AppContext::builder()
            .loop_factory(ScriptedFactory::new(true))
            .build();
        let outer = Arc::new(ScriptedLoop::default());
        let inner = Arc::new(ScriptedLoop::default());

        assert!(!app.pending());
        assert!(!app.dispatch());

        let _outer = ActiveLoopGuard::activate(app.loops(), outer.clone());
        {
            let _inner = ActiveLoopGuard::activate(app.loops(), inner.clone());
            assert!(app.pending());
            assert!(app.yield_now(false));
            assert_eq!(inner.yields.load(Ordering::SeqCst), 1);
            assert_eq!(outer.yields.load(Ordering::SeqCst), 0);
        }

        assert!(app.yield_now(false));
        assert_eq!(outer.yields.load(Ordering::SeqCst), 1);
        assert!(app.uses_event_loop());
    }

    #[test]
    fn test_yield_without_active_loop_uses_temporary() {
        let factory = ScriptedFactory::new(true);
        let app = AppContext::builder().loop_factory(factory.clone()).build();

        assert!(app.yield_now(true));

        let created = factory.created.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].yields.load(Ordering::SeqCst), 1);
        assert!(!app.uses_event_loop());
    }

    #[test]
    fn test_create_loop_reports_factory_failure() {
        let app = AppContext::builder()
            .loop_factory(ScriptedFactory::new(false))
            .build();

        assert!(matches!(app.loops().create_loop(), Err(AppError::LoopCreation)));
    }

    #[test]
    fn test_yield_without_any_loop_fails() {
        let app = AppContext::builder()
            .loop_factory(ScriptedFactory::new(false))
            .build();

        assert!(!app.yield_now(false));
    }

    #[test]
    fn test_main_guard_cleared_on_unwind() {
        let app = AppContext::builder()
            .loop_factory(ScriptedFactory::new(true))
            .build();
        let main: Arc<dyn EventLoop> = Arc::new(ScriptedLoop::default());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _main = MainLoopGuard::install(app.loops(), main.clone());
            let _active = ActiveLoopGuard::activate(app.loops(), main.clone());
            panic!("loop body failed");
        }));

        assert!(result.is_err());
        assert!(!app.is_main_loop_running());
        assert!(!app.uses_event_loop());
    }
}
