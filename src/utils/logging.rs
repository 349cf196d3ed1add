//! Logging configuration and subscriber setup

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{TranscodeError, TranscodeResult};

/// Logging configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level
    pub level: LogLevel,
    /// Emit one JSON object per event instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// General information
    Info,
    /// Debug information
    Debug,
    /// Very verbose debug information
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = TranscodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(TranscodeError::ConfigError {
                message: format!("Unknown log level: {}", other),
            }),
        }
    }
}

/// Build the event filter; `RUST_LOG` wins over the configured level
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install the global subscriber.
///
/// Calling this more than once is harmless: later calls keep the subscriber
/// that is already installed and return `false`.
pub fn init_logging(config: &LoggingConfig) -> TranscodeResult<bool> {
    let filter = build_filter(config);
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::debug!("Logging initialized with level {}", config.level);
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

/// Log build and platform information
pub fn log_system_info(config: &LoggingConfig) {
    tracing::info!("=== TrimX Transcoder ===");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "macos")]
    tracing::info!("Platform: macOS");
    #[cfg(target_os = "linux")]
    tracing::info!("Platform: Linux");
    #[cfg(target_os = "windows")]
    tracing::info!("Platform: Windows");

    tracing::info!("Native container support: {}", cfg!(feature = "libav"));
    tracing::debug!("Logging level: {}, json: {}", config.level, config.json);
}
