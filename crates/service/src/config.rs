//! Configuration management for the Companion Link service.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/companion/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("send_queue_depth must be between 1 and 65536 packets, got {0}")]
    InvalidSendQueueDepth(usize),

    #[error("timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidNegotiationTimeout(u64),

    #[error("handshake_timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for every configurable timeout.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Upper bound for the per-stream send queue.
const MAX_SEND_QUEUE_DEPTH: usize = 65536;

/// Main configuration structure for the Companion Link service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General service configuration.
    pub service: ServiceConfig,

    /// Transport-facing packet stream settings.
    pub transport: TransportConfig,

    /// Version negotiation and handshake timeouts.
    pub negotiation: NegotiationConfig,

    /// Secure channel behaviour.
    pub channel: ChannelConfig,

    /// Reconnection policy.
    pub reconnect: ReconnectConfig,

    /// Head unit user settings.
    pub users: UsersConfig,
}

/// General service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory for storing service data (associated devices).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Identifier this host presents to devices during association.
    ///
    /// Generated by `companiond config init`; a random id is used for the
    /// process lifetime when absent.
    pub host_id: Option<Uuid>,
}

/// Packet stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of packets queued for writing per stream.
    pub send_queue_depth: usize,
}

/// Negotiation and handshake timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Seconds each negotiation step may take before failing.
    pub timeout_secs: u64,

    /// Seconds the encryption handshake may take before verification.
    pub handshake_timeout_secs: u64,
}

/// Secure channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Compress outbound payloads when the peer supports it.
    pub compression: bool,

    /// Offer out-of-band verification during association.
    pub oob_verification: bool,
}

/// Reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect to enabled devices after their last transport drops.
    pub auto_reconnect: bool,
}

/// Head unit user settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsersConfig {
    /// User id of the driver; devices owned by any other user are passengers.
    pub driver_user_id: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            host_id: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: 256,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            handshake_timeout_secs: 30,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            compression: true,
            oob_verification: false,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
        }
    }
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self { driver_user_id: 10 }
    }
}

impl NegotiationConfig {
    /// Negotiation step timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("companion")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("companion")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - COMPANION_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - COMPANION_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("COMPANION_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log_level from environment");
                self.service.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("COMPANION_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!(dir = %dir, "Overriding data_dir from environment");
                self.service.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let depth = self.transport.send_queue_depth;
        if depth < 1 || depth > MAX_SEND_QUEUE_DEPTH {
            return Err(ConfigError::InvalidSendQueueDepth(depth));
        }

        let timeout = self.negotiation.timeout_secs;
        if timeout < 1 || timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidNegotiationTimeout(timeout));
        }

        let handshake_timeout = self.negotiation.handshake_timeout_secs;
        if handshake_timeout < 1 || handshake_timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidHandshakeTimeout(handshake_timeout));
        }

        let level = self.service.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.service.log_level.clone()));
        }

        Ok(())
    }

    /// Returns the configured host id, generating and storing one if absent.
    pub fn ensure_host_id(&mut self) -> Uuid {
        *self.service.host_id.get_or_insert_with(Uuid::new_v4)
    }

    /// Path of the associated device store inside the data directory.
    pub fn device_store_path(&self) -> PathBuf {
        self.service.data_dir.join("associated_devices.json")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
