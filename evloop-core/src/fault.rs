//! Fault capture at the dispatch boundary.
//!
//! Handler and observer callbacks run through [`capture`], which turns both
//! returned errors and panics into a [`Fault`]. Faults are then handed to the
//! application delegate instead of unwinding into the run loop.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, warn};

use crate::error::{AppError, AppResult};

/// A failure that escaped a callback.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("panic with message \"{message}\"")]
    Panic { message: String },

    #[error("error \"{0:#}\"")]
    Error(anyhow::Error),
}

impl Fault {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self::Panic { message }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic { .. })
    }
}

/// Run `f`, converting an `Err` or a panic into a [`Fault`].
pub fn capture<F>(f: F) -> Result<(), Fault>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Fault::Error(e)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

/// Last-resort reporting used when no delegate handles the fault.
pub fn report_unhandled(fault: &Fault) {
    let thread = std::thread::current();
    error!(
        thread = thread.name().unwrap_or("<unnamed>"),
        "Unhandled {fault} escaped event dispatch"
    );
}

/// Holds at most one fault for a later rethrow.
#[derive(Debug, Default)]
pub struct FaultSlot {
    slot: Mutex<Option<Fault>>,
}

impl FaultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `fault`. Returns `false` and drops it if a fault is already held.
    pub fn store(&self, fault: Fault) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            warn!("Fault slot occupied, dropping {fault}");
            return false;
        }

        *slot = Some(fault);
        true
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Take the stored fault, if any, and return it as an error.
    pub fn rethrow(&self) -> AppResult<()> {
        match self.slot.lock().take() {
            Some(fault) => Err(AppError::StoredFault(fault.to_string())),
            None => Ok(()),
        }
    }
}

/// Reports programming-error contract violations.
#[derive(Debug)]
pub struct ContractMonitor {
    panic_on_violation: bool,
    violations: AtomicU64,
}

impl ContractMonitor {
    pub fn new(panic_on_violation: bool) -> Self {
        Self {
            panic_on_violation,
            violations: AtomicU64::new(0),
        }
    }

    pub fn report(&self, message: &str) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        error!("Contract violation: {message}");

        if self.panic_on_violation {
            panic!("contract violation: {message}");
        }
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}
