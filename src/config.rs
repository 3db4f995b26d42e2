//! # Host Configuration
//!
//! ```toml
//! [control]
//! socket_path = "/var/run/wokfs.sock"
//! privileged_uid = 0
//! max_sessions = 8
//! max_frame_bytes = 8192
//! send_timeout_ms = 5000
//!
//! [modules]
//! load_timeout_ms = 5000
//! reload_strategy = "staged"   # or "destroy_first"
//!
//! [[modules.preload]]
//! path = "/usr/lib/wokfs/mod_cache.so"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every section is optional; missing fields take the defaults below.

use crate::stack::{ReloadStrategy, StackOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Uid allowed to insert, reload and remove modules.
    #[serde(default)]
    pub privileged_uid: u32,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// How long a listing may wait on a peer that is not reading.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl ControlConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            privileged_uid: 0,
            max_sessions: default_max_sessions(),
            max_frame_bytes: default_max_frame_bytes(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModulesConfig {
    /// Upper bound on a single module load. Unbounded when absent.
    #[serde(default)]
    pub load_timeout_ms: Option<u64>,
    #[serde(default)]
    pub reload_strategy: ReloadStrategy,
    /// Modules inserted at startup, outermost first.
    #[serde(default)]
    pub preload: Vec<PreloadModule>,
}

impl ModulesConfig {
    pub fn stack_options(&self) -> StackOptions {
        StackOptions {
            load_timeout: self.load_timeout_ms.map(Duration::from_millis),
            reload_strategy: self.reload_strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PreloadModule {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.level)))
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/wokfs.sock")
}
fn default_max_sessions() -> usize {
    8
}
fn default_max_frame_bytes() -> usize {
    8192
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Smallest frame that still fits a list request.
const MIN_FRAME_BYTES: usize = 64;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "control.max_sessions must be at least 1".to_string(),
            ));
        }
        if self.control.max_sessions > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "control.max_sessions must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.control.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.send_timeout_ms must be positive".to_string(),
            ));
        }
        if self.control.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(ConfigError::Invalid(format!(
                "control.max_frame_bytes must be at least {}",
                MIN_FRAME_BYTES
            )));
        }
        if self.modules.load_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "modules.load_timeout_ms must be positive".to_string(),
            ));
        }
        self.logging.tracing_level()?;
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
