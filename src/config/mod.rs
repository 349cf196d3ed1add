//! Configuration loading with precedence: CLI > Env > File > Defaults

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::drain::DecoderDrainPolicy;
use crate::error::{TranscodeError, TranscodeResult};
use crate::utils::logging::{LogLevel, LoggingConfig};

pub const ENV_PREVIEW_INTERVAL_MS: &str = "TRANSCODER_PREVIEW_INTERVAL_MS";
pub const ENV_DECODER_DRAIN: &str = "TRANSCODER_DECODER_DRAIN";
pub const ENV_MAX_IDLE_DRAIN_PASSES: &str = "TRANSCODER_MAX_IDLE_DRAIN_PASSES";
pub const ENV_LOG_LEVEL: &str = "TRANSCODER_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "TRANSCODER_LOG_JSON";

/// Runtime settings of the transcoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Minimum time between preview decodes of a copied stream; negative disables them
    pub preview_interval_ms: i64,
    /// How the decoder drain phase decides it is finished
    pub decoder_drain: DecoderDrainPolicy,
    /// Consecutive drain passes without output before a phase is abandoned
    pub max_idle_drain_passes: u32,
    pub logging: LoggingConfig,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            preview_interval_ms: 1_000,
            decoder_drain: DecoderDrainPolicy::default(),
            max_idle_drain_passes: 16,
            logging: LoggingConfig::default(),
        }
    }
}

impl TranscoderConfig {
    /// Defaults, then the file (if any), then the process environment
    pub fn load(path: Option<&Path>) -> TranscodeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML or YAML file, chosen by extension
    pub fn from_file(path: &Path) -> TranscodeResult<Self> {
        if !path.exists() {
            return Err(TranscodeError::ConfigError {
                message: format!("Config file does not exist: {}", path.display()),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let config = match extension.as_str() {
            "toml" => toml::from_str(&content).map_err(|e| TranscodeError::ConfigError {
                message: format!("Failed to parse TOML config {}: {}", path.display(), e),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| TranscodeError::ConfigError {
                message: format!("Failed to parse YAML config {}: {}", path.display(), e),
            })?,
            other => {
                return Err(TranscodeError::ConfigError {
                    message: format!("Unsupported config format '{}': {}", other, path.display()),
                })
            }
        };
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> TranscodeResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> TranscodeResult<()> {
        let mut overrides = 0;

        if let Some(value) = lookup(ENV_PREVIEW_INTERVAL_MS) {
            self.preview_interval_ms = parse_env(ENV_PREVIEW_INTERVAL_MS, &value)?;
            overrides += 1;
        }
        if let Some(value) = lookup(ENV_DECODER_DRAIN) {
            self.decoder_drain = value.parse()?;
            overrides += 1;
        }
        if let Some(value) = lookup(ENV_MAX_IDLE_DRAIN_PASSES) {
            self.max_idle_drain_passes = parse_env(ENV_MAX_IDLE_DRAIN_PASSES, &value)?;
            overrides += 1;
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = value.parse::<LogLevel>()?;
            overrides += 1;
        }
        if let Some(value) = lookup(ENV_LOG_JSON) {
            self.logging.json = parse_bool(ENV_LOG_JSON, &value)?;
            overrides += 1;
        }

        if overrides > 0 {
            debug!("Applied {} environment variable overrides", overrides);
        }
        Ok(())
    }

    pub fn validate(&self) -> TranscodeResult<()> {
        if self.max_idle_drain_passes == 0 {
            return Err(TranscodeError::ConfigError {
                message: "max_idle_drain_passes must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> TranscodeResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| TranscodeError::ConfigError {
        message: format!("Invalid value for {}: '{}' ({})", key, value, e),
    })
}

fn parse_bool(key: &str, value: &str) -> TranscodeResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TranscodeError::ConfigError {
            message: format!("Invalid boolean value for {}: '{}'", key, value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TranscoderConfig::default();
        assert_eq!(config.preview_interval_ms, 1_000);
        assert_eq!(config.decoder_drain, DecoderDrainPolicy::FixedPoint);
        assert_eq!(config.max_idle_drain_passes, 16);
        assert_eq!(config.logging.level, LogLevel::Info);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TranscoderConfig::default();
        config
            .apply_env_from(lookup(&[
                (ENV_PREVIEW_INTERVAL_MS, "-1"),
                (ENV_DECODER_DRAIN, "single-pass"),
                (ENV_MAX_IDLE_DRAIN_PASSES, "4"),
                (ENV_LOG_LEVEL, "trace"),
                (ENV_LOG_JSON, "yes"),
            ]))
            .unwrap();
        assert_eq!(config.preview_interval_ms, -1);
        assert_eq!(config.decoder_drain, DecoderDrainPolicy::SinglePass);
        assert_eq!(config.max_idle_drain_passes, 4);
        assert_eq!(config.logging.level, LogLevel::Trace);
        assert!(config.logging.json);
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let mut config = TranscoderConfig::default();
        assert!(config.apply_env_from(lookup(&[(ENV_MAX_IDLE_DRAIN_PASSES, "many")])).is_err());
        assert!(config.apply_env_from(lookup(&[(ENV_LOG_JSON, "perhaps")])).is_err());
        assert!(config.apply_env_from(lookup(&[(ENV_LOG_LEVEL, "shout")])).is_err());
    }

    #[test]
    fn test_zero_idle_bound_is_invalid() {
        let config = TranscoderConfig {
            max_idle_drain_passes: 0,
            ..TranscoderConfig::default()
        };
        assert!(matches!(config.validate(), Err(TranscodeError::ConfigError { .. })));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: TranscoderConfig = toml::from_str("preview_interval_ms = 250\n[logging]\njson = true\n").unwrap();
        assert_eq!(config.preview_interval_ms, 250);
        assert_eq!(config.max_idle_drain_passes, 16);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.logging.json);
    }
}
