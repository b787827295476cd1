//! src/config.rs
//! ============================================================================
//! # Config: Dispatch Core Configuration Loader and Saver
//!
//! Loads and saves settings as TOML from the platform config path using the
//! [`directories`](https://docs.rs/directories) crate. Missing files fall back
//! to defaults, and missing sections or fields default individually.
//!
//! ## Example
//! ```rust,ignore
//! let config = Config::load().await?;
//! config.save().await?;
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use tokio::fs as TokioFs;

use crate::error::{AppError, AppResult};

/// Pending-event dispatch settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Start with pending-event processing suspended
    pub start_suspended: bool,
}

/// Main loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainLoopConfig {
    /// Longest time an idle loop blocks waiting for posted work
    #[serde(with = "humantime_serde")]
    pub idle_wait: Duration,

    /// Exit code returned when no loop could be created, and used when exit
    /// is requested without a main loop
    pub failure_exit_code: i32,
}

impl Default for MainLoopConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(50),
            failure_exit_code: -1,
        }
    }
}

/// Programming-error contract checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Panic on a contract violation instead of logging and continuing
    pub panic_on_violation: bool,
}

/// Log file rotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Never,

    #[default]
    Daily,
}

/// Logging settings consumed by [`crate::logging::LoggerBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `evloop_core=debug`
    pub level: String,

    pub log_dir: PathBuf,

    pub file_prefix: String,

    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("./logs"),
            file_prefix: "evloop".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

/// Main configuration struct for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub main_loop: MainLoopConfig,

    #[serde(default)]
    pub contracts: ContractConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads config from the platform config dir, or writes and returns defaults.
    ///
    /// The config is expected at `$XDG_CONFIG_HOME/evloop/config.toml`
    /// (Linux), or equivalent on Windows/macOS.
    pub async fn load() -> AppResult<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path).await
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save_to(&path).await?;

            Ok(default_config)
        }
    }

    /// Loads config from an explicit path.
    pub async fn load_from(path: &Path) -> AppResult<Self> {
        info!("Loading config from {}", path.display());

        let text = TokioFs::read_to_string(path)
            .await
            .map_err(|e| AppError::config_io(path, e))?;

        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Saves config to the platform config dir.
    pub async fn save(&self) -> AppResult<()> {
        let path = Self::config_path()?;
        self.save_to(&path).await
    }

    pub async fn save_to(&self, path: &Path) -> AppResult<()> {
        info!("Saving config to {}", path.display());

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::config_io(parent, e))?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        TokioFs::write(path, toml_str)
            .await
            .map_err(|e| AppError::config_io(path, e))?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> AppResult<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> AppResult<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("org", "evloop", "evloop").ok_or(AppError::ConfigDirUnavailable)?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }
}
