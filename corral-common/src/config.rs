//! Configuration loading for Corral components.
//!
//! Values come from an optional TOML file with `CORRAL_`-prefixed
//! environment overrides applied on top. Durations are written in
//! humantime form (`"30s"`, `"5m"`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default interval between agent reconciliation ticks.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a stuck subsystem freeze is tolerated before the agent
/// forcibly releases it.
const DEFAULT_FREEZE_ESCAPE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors from loading or overriding configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for {var}: '{value}'")]
    InvalidDuration { var: String, value: String },
}

/// Top-level Corral configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorralConfig {
    #[serde(default)]
    pub agent: AgentSettings,
}

/// Host agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Hostname this agent manages. Unset means the host process decides.
    #[serde(default)]
    pub host_name: Option<String>,

    /// Interval between reconciliation ticks.
    #[serde(default = "default_tick_interval", with = "duration_str")]
    pub tick_interval: Duration,

    /// How long a stuck subsystem freeze is tolerated before being released.
    #[serde(default = "default_freeze_escape_timeout", with = "duration_str")]
    pub freeze_escape_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            host_name: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            freeze_escape_timeout: DEFAULT_FREEZE_ESCAPE_TIMEOUT,
        }
    }
}

fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}

fn default_freeze_escape_timeout() -> Duration {
    DEFAULT_FREEZE_ESCAPE_TIMEOUT
}

/// Serde adapter for humantime-formatted durations.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl CorralConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CORRAL_`-prefixed environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("CORRAL_HOST_NAME") {
            self.agent.host_name = Some(value);
        }
        if let Some(value) = env_duration("CORRAL_TICK_INTERVAL")? {
            self.agent.tick_interval = value;
        }
        if let Some(value) = env_duration("CORRAL_FREEZE_ESCAPE_TIMEOUT")? {
            self.agent.freeze_escape_timeout = value;
        }
        Ok(())
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match humantime::parse_duration(&value) {
            Ok(duration) => Ok(Some(duration)),
            Err(_) => Err(ConfigError::InvalidDuration {
                var: var.to_string(),
                value,
            }),
        },
        Err(_) => Ok(None),
    }
}
