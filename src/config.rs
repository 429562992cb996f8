//! Application configuration loaded from TOML
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Where the profile document lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default = "default_profiles_file")]
    pub profiles_file: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            profiles_file: default_profiles_file(),
        }
    }
}

/// Per-session tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Batch tick interval for inbound messages
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// How long teardown waits for the worker before aborting it
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Capacity of observer broadcast channels
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SessionSection {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Defaults applied to the MQTT transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// rumqttc request channel capacity
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Used when a profile leaves keep-alive at 0
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    /// Used when a profile leaves the connect timeout at 0
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u16,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_profiles_file() -> PathBuf {
    PathBuf::from("connections.json")
}

fn default_batch_interval_ms() -> u64 {
    50
}

fn default_disconnect_timeout_ms() -> u64 {
    2000
}

fn default_event_capacity() -> usize {
    256
}

fn default_request_capacity() -> usize {
    10
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_connect_timeout_secs() -> u16 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.batch_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.batch_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.session.disconnect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.disconnect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.session.event_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.event_capacity must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.session.batch_interval(), Duration::from_millis(50));
        assert_eq!(config.session.disconnect_timeout(), Duration::from_secs(2));
        assert_eq!(config.mqtt.request_capacity, 10);
        assert_eq!(config.storage.profiles_file, PathBuf::from("connections.json"));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
[session]
batch_interval_ms = 100
"#,
        )
        .unwrap();

        assert_eq!(config.session.batch_interval_ms, 100);
        assert_eq!(config.session.event_capacity, 256);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
    }

    #[test]
    fn test_zero_values_are_rejected() {
        for toml_content in [
            "[session]\nbatch_interval_ms = 0",
            "[session]\ndisconnect_timeout_ms = 0",
            "[session]\nevent_capacity = 0",
            "[mqtt]\nrequest_capacity = 0",
        ] {
            let result = AppConfig::from_toml_str(toml_content);
            assert!(
                matches!(result, Err(ConfigError::InvalidConfig(_))),
                "expected rejection for {toml_content:?}"
            );
        }
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert_eq!(AppConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
