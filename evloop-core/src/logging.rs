//! src/logging.rs
//! ============================================================================
//! # Logging: tracing subscriber setup and the buffered diagnostic sink
//!
//! [`LoggerBuilder`] installs the global `tracing` subscriber: an `EnvFilter`
//! built from [`LoggingConfig::level`] and a `fmt` layer writing through a
//! non-blocking rolling file appender. Keep the returned `WorkerGuard` alive
//! for the life of the process or buffered lines are lost.
//!
//! [`BufferedLog`] is the diagnostic sink flushed once per idle cycle: code
//! running inside handlers records messages cheaply and they are emitted
//! through `tracing` after the idle notification has been delivered.

use std::{
    path::{Component, Path},
    str::FromStr,
};

use parking_lot::Mutex;
use tokio::fs as TokioFs;
use tracing::{Level, debug, error, info, trace, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::Directive, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogRotation, LoggingConfig};
use crate::error::{AppError, AppResult};

pub struct LoggerBuilder {
    config: LoggingConfig,
}

impl LoggerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: LoggingConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: LoggingConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(self) -> AppResult<WorkerGuard> {
        validate_log_directory(&self.config.log_dir)?;
        setup_log_directory(&self.config.log_dir).await?;

        let rotation = match self.config.rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Daily => Rotation::DAILY,
        };

        let file_appender = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(self.config.file_prefix.as_str())
            .filename_suffix("log")
            .build(&self.config.log_dir)
            .map_err(|e| AppError::logging(format!("Failed to create file appender: {e}")))?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(make_filter(&self.config.level)?);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .try_init()
            .map_err(|e| {
                AppError::logging(format!("Failed to install global tracing subscriber: {e}"))
            })?;

        Ok(guard)
    }
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn make_filter(level: &str) -> AppResult<EnvFilter> {
    let directive = Directive::from_str(level)
        .map_err(|e| AppError::logging(format!("Invalid log level in config: {e}")))?;

    Ok(EnvFilter::from_default_env().add_directive(directive))
}

fn validate_log_directory(path: &Path) -> AppResult<()> {
    if path.components().count() == 0 {
        return Err(AppError::logging("Invalid log directory: empty path"));
    }

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(AppError::logging(
            "Invalid log directory: path contains parent directory references",
        ));
    }

    Ok(())
}

async fn setup_log_directory(log_dir: &Path) -> AppResult<()> {
    if !log_dir.exists() {
        TokioFs::create_dir_all(log_dir).await.map_err(|e| {
            AppError::logging(format!(
                "Failed to create log directory {}: {e}",
                log_dir.display()
            ))
        })?;
    }
    Ok(())
}

pub async fn init_logging_with_config(config: LoggingConfig) -> AppResult<WorkerGuard> {
    LoggerBuilder::new().with_config(config).build().await
}

/// Destination for diagnostics that are batched between idle cycles.
pub trait DiagnosticSink: Send + Sync {
    /// Emit everything buffered so far.
    fn flush_active(&self);
}

#[derive(Debug, Clone)]
struct BufferedEntry {
    level: Level,
    message: String,
}

/// Diagnostic sink that holds messages until the next idle flush.
#[derive(Debug, Default)]
pub struct BufferedLog {
    entries: Mutex<Vec<BufferedEntry>>,
}

impl BufferedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log<S: Into<String>>(&self, level: Level, message: S) {
        self.entries.lock().push(BufferedEntry {
            level,
            message: message.into(),
        });
    }

    pub fn buffered(&self) -> usize {
        self.entries.lock().len()
    }
}

impl DiagnosticSink for BufferedLog {
    fn flush_active(&self) {
        // Take the batch first: emitting may log again through this sink.
        let batch = std::mem::take(&mut *self.entries.lock());

        for entry in batch {
            match entry.level {
                Level::ERROR => error!(target: "evloop::diagnostics", "{}", entry.message),
                Level::WARN => warn!(target: "evloop::diagnostics", "{}", entry.message),
                Level::INFO => info!(target: "evloop::diagnostics", "{}", entry.message),
                Level::DEBUG => debug!(target: "evloop::diagnostics", "{}", entry.message),
                Level::TRACE => trace!(target: "evloop::diagnostics", "{}", entry.message),
            }
        }
    }
}
