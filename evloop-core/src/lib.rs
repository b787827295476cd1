pub mod error;

pub mod config;

pub mod fault;

pub mod app;
pub use app::{AppContext, AppContextBuilder, AppDelegate, DefaultDelegate, FilterResult};

pub mod controller {

    pub mod handler;
    pub use handler::{
        Categorized, CategoryMask, EventCategory, EventHandler, HandlerId, HandlerRef,
        QueuedHandler,
    };

    pub mod registry;
    pub use registry::HandlerRegistry;

    pub mod dispatcher;
    pub use dispatcher::PendingEventDispatcher;

    pub mod idle;
    pub use idle::{IdleDispatcher, IdleEvent, IdleObserver, ObserverId};

    pub mod destruction;
    pub use destruction::{DeferredDestructionQueue, Disposable};

    pub mod main_loop;
    pub use main_loop::{ActiveLoopGuard, EventLoop, LoopFactory, MainLoopGuard, MainLoopOwner};

    pub mod cooperative;
    pub use cooperative::{CooperativeFactory, CooperativeLoop, LoopProxy};
}

pub mod logging;
pub use logging::{BufferedLog, DiagnosticSink, LoggerBuilder};

pub use config::Config;
pub use error::{AppError, AppResult};
pub use fault::Fault;
