//! src/main.rs
//! Demo: a producer thread feeds a queued handler while the main loop idles

use std::{
    panic::PanicHookInfo,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use evloop_core::{
    AppContext, Config,
    controller::{Categorized, EventCategory, IdleEvent, QueuedHandler},
    logging::init_logging_with_config,
};

const TICKS: u32 = 5;

#[derive(Debug)]
struct Tick(u32);

impl Categorized for Tick {
    fn category(&self) -> EventCategory {
        EventCategory::Timer
    }
}

fn main() -> Result<()> {
    setup_panic_handler();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let config = runtime.block_on(Config::load()).unwrap_or_else(|e| {
        eprintln!("Falling back to default configuration: {e}");
        Config::default()
    });

    let _log_guard = runtime
        .block_on(init_logging_with_config(config.logging.clone()))
        .context("Failed to initialize logging")?;

    let app = AppContext::builder().config(config).build();

    let handled = Arc::new(AtomicU32::new(0));
    let counter = handled.clone();
    let ticks = QueuedHandler::new("ticks", move |_app: &AppContext, tick: Tick| {
        info!(tick = tick.0, "Handled tick");
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    let seen = handled.clone();
    app.add_idle_observer(Arc::new(
        move |app: &AppContext, _event: &mut IdleEvent| -> anyhow::Result<()> {
            if seen.load(Ordering::Relaxed) >= TICKS {
                app.exit_main_loop();
            }
            Ok(())
        },
    ));

    let producer = {
        let app = app.clone();
        let ticks = ticks.clone();
        thread::spawn(move || {
            for n in 1..=TICKS {
                thread::sleep(Duration::from_millis(20));
                ticks.queue_event(&app, Tick(n));
            }
        })
    };

    let code = app.main_loop();

    if producer.join().is_err() {
        warn!("Producer thread panicked");
    }
    app.on_exit();

    info!(code, handled = handled.load(Ordering::Relaxed), "Demo finished");
    if code != 0 {
        anyhow::bail!("Main loop exited with code {code}");
    }
    Ok(())
}

fn setup_panic_handler() {
    let original_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        error!("Application panicked: {}", panic_info);
        original_hook(panic_info);
    }));
}
