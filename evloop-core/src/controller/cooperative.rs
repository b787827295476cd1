//! CooperativeLoop: a software run loop over a crossbeam channel
//!
//! Stands in for a platform loop. Posted calls play the role of native
//! events; every iteration drains pending handler events first, then
//! dispatches one posted call, and runs an idle cycle when nothing was posted.
//!
//! Posted calls that a selective yield filters out are parked in a backlog
//! and dispatched, in order, once the filter is lifted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::app::{AppContext, FilterResult};
use crate::config::MainLoopConfig;

use super::handler::{CategoryMask, EventCategory};
use super::main_loop::{EventLoop, LoopFactory};

pub type PostedFn = Box<dyn FnOnce(&AppContext) -> anyhow::Result<()> + Send>;

struct PostedCall {
    category: EventCategory,
    call: PostedFn,
}

enum LoopMessage {
    Post(PostedCall),
    Wake,
}

pub struct CooperativeLoop {
    tx: Sender<LoopMessage>,
    rx: Receiver<LoopMessage>,
    backlog: Mutex<VecDeque<PostedCall>>,
    filter: Mutex<Option<CategoryMask>>,
    exit_code: Mutex<Option<i32>>,
    running: AtomicBool,
    yielding: AtomicBool,
    idle_wait: Duration,
}

impl CooperativeLoop {
    pub fn new(idle_wait: Duration) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            backlog: Mutex::new(VecDeque::new()),
            filter: Mutex::new(None),
            exit_code: Mutex::new(None),
            running: AtomicBool::new(false),
            yielding: AtomicBool::new(false),
            idle_wait,
        }
    }

    /// Cloneable handle for posting from any thread.
    pub fn proxy(&self) -> LoopProxy {
        LoopProxy {
            tx: self.tx.clone(),
        }
    }

    pub fn post<F>(&self, category: EventCategory, call: F)
    where
        F: FnOnce(&AppContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.proxy().post(category, call);
    }

    fn exit_requested(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    fn allows(&self, category: EventCategory) -> bool {
        self.filter.lock().is_none_or(|mask| mask.allows(category))
    }

    /// Next posted call the current filter allows, without blocking.
    fn next_allowed(&self) -> Option<PostedCall> {
        {
            let mut backlog = self.backlog.lock();
            let index = backlog.iter().position(|p| self.allows(p.category));
            if let Some(call) = index.and_then(|i| backlog.remove(i)) {
                return Some(call);
            }
        }

        loop {
            match self.rx.try_recv() {
                Ok(LoopMessage::Post(posted)) if self.allows(posted.category) => {
                    return Some(posted);
                }
                Ok(LoopMessage::Post(posted)) => self.backlog.lock().push_back(posted),
                Ok(LoopMessage::Wake) => continue,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn dispatch_posted(&self, app: &AppContext) -> bool {
        match self.next_allowed() {
            Some(posted) => {
                if app.filter_event(posted.category) == FilterResult::Skip {
                    trace!(category = ?posted.category, "Dispatching posted call");
                    app.safely_call(|| (posted.call)(app));
                }
                true
            }
            None => false,
        }
    }

    /// Block for at most `timeout` waiting for a message. Posted calls are
    /// parked for the next dispatch.
    fn wait_for_work(&self, timeout: Duration) {
        match self.rx.recv_timeout(timeout) {
            Ok(LoopMessage::Post(posted)) => self.backlog.lock().push_back(posted),
            Ok(LoopMessage::Wake) => {}
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
        }
    }
}

impl EventLoop for CooperativeLoop {
    fn run(&self, app: &AppContext) -> i32 {
        {
            // `running` and `exit_code` change together under the exit lock.
            let mut exit_code = self.exit_code.lock();
            if self.running.swap(true, Ordering::AcqRel) {
                drop(exit_code);
                app.contracts().report("cooperative loop is already running");
                return -1;
            }
            *exit_code = None;
        }
        debug!("Cooperative loop started");

        let code = loop {
            if let Some(code) = self.exit_requested() {
                break code;
            }

            app.process_pending_events();

            if self.dispatch_posted(app) {
                continue;
            }

            if let Some(code) = self.exit_requested() {
                break code;
            }

            let more = app.process_idle();

            if let Some(code) = self.exit_requested() {
                break code;
            }

            let drainable = app.has_pending_events() && !app.dispatcher().is_suspended();
            if !more && !drainable {
                self.wait_for_work(self.idle_wait);
            }
        };

        {
            let mut exit_code = self.exit_code.lock();
            self.running.store(false, Ordering::Release);
            *exit_code = None;
        }
        debug!(code, "Cooperative loop stopped");
        code
    }

    fn exit(&self, code: i32) {
        {
            let mut exit_code = self.exit_code.lock();
            if !self.is_running() {
                debug!(code, "Exit requested on a loop that is not running");
                return;
            }
            *exit_code = Some(code);
        }
        self.wake_up();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn pending(&self) -> bool {
        !self.backlog.lock().is_empty() || !self.rx.is_empty()
    }

    fn dispatch(&self, app: &AppContext) -> bool {
        while !self.dispatch_posted(app) {
            if self.exit_requested().is_some() {
                return false;
            }
            match self.rx.recv() {
                Ok(LoopMessage::Post(posted)) => self.backlog.lock().push_back(posted),
                Ok(LoopMessage::Wake) => {}
                Err(_) => return false,
            }
        }

        self.exit_requested().is_none()
    }

    fn yield_for(&self, app: &AppContext, allowed: CategoryMask, only_if_needed: bool) -> bool {
        if self.yielding.swap(true, Ordering::AcqRel) {
            if !only_if_needed {
                app.contracts().report("recursive yield on the cooperative loop");
            }
            return false;
        }

        let previous = self.filter.lock().replace(allowed);

        while self.dispatch_posted(app) {}
        app.process_pending_events();

        *self.filter.lock() = previous;
        self.yielding.store(false, Ordering::Release);
        true
    }

    fn is_event_allowed(&self, category: EventCategory) -> bool {
        self.allows(category)
    }

    fn wake_up(&self) {
        let _ = self.tx.send(LoopMessage::Wake);
    }
}

/// Posting handle that can cross threads.
#[derive(Clone)]
pub struct LoopProxy {
    tx: Sender<LoopMessage>,
}

impl LoopProxy {
    pub fn post<F>(&self, category: EventCategory, call: F)
    where
        F: FnOnce(&AppContext) -> anyhow::Result<()> + Send + 'static,
    {
        let posted = PostedCall {
            category,
            call: Box::new(call),
        };
        // The receiver lives as long as the loop; a send error means it is gone.
        let _ = self.tx.send(LoopMessage::Post(posted));
    }

    pub fn wake(&self) {
        let _ = self.tx.send(LoopMessage::Wake);
    }
}

/// Creates a fresh [`CooperativeLoop`] per request.
#[derive(Debug, Default)]
pub struct CooperativeFactory;

impl LoopFactory for CooperativeFactory {
    fn create_loop(&self, config: &MainLoopConfig) -> Option<Arc<dyn EventLoop>> {
        Some(Arc::new(CooperativeLoop::new(config.idle_wait)))
    }
}
