//! src/error.rs
//! ============================================================================
//! # `AppError`: Unified Error Type for the dispatch core
//!
//! Fallible ambient operations (config, logging, loop creation, stored fault
//! rethrow) return `AppResult<T>`. Callback faults never surface here
//! directly; they go through the fault boundary in [`crate::fault`].

use std::{io, path::PathBuf};
use thiserror::Error;

/// Unified error type for all dispatch-core operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Standard IO error, auto-converted from `io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML config parsing error.
    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// TOML config serialization error.
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Config file I/O error with path.
    #[error("Failed to access config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No platform directory could be determined for the config file.
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,

    /// Logging subsystem could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// The loop factory declined to create an event loop.
    #[error("Event loop could not be created")]
    LoopCreation,

    /// A fault captured at the dispatch boundary and rethrown later.
    #[error("Stored fault rethrown: {0}")]
    StoredFault(String),

    /// Any other error, with description.
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl AppError {
    #[must_use]
    /// Attach extra context to an error.
    pub fn with_context<S: Into<String>>(self, ctx: S) -> Self {
        Self::Other(format!("{}: {}", ctx.into(), self))
    }

    /// Create a config I/O error for `path`
    pub fn config_io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        Self::ConfigIo {
            path: path.into(),
            source,
        }
    }

    /// Create a logging setup error
    pub fn logging<S: Into<String>>(reason: S) -> Self {
        Self::Logging(reason.into())
    }
}

// Allow conversion from `anyhow::Error` as fallback.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
