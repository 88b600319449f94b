//! Layered TOML configuration for sluice.
//!
//! Loads from:
//! - Global config: `~/.config/sluice/sluice.toml`
//! - Project config: `<workspace>/.sluice/sluice.toml`
//!
//! Project values take precedence field by field. Unset fields fall back to
//! the built-in defaults when resolved.
//!
//! # Example
//!
//! ```no_run
//! use sluice_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{}:{}", config.proxy.host(), config.proxy.port());
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default listening host.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_FIRST_CHUNK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[proxy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Listening host or IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Listening port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Upstream dial timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Relay idle timeout in seconds. `0` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// How long a new client may stay silent, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk_timeout_secs: Option<u64>,

    /// Connections beyond this are closed on accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl ProxySettings {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Zero is passed through as-is; the proxy refuses to start with it.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// `None` when idle connections are kept forever.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Like [`ProxySettings::connect_timeout`], zero is not a valid bound.
    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_secs(
            self.first_chunk_timeout_secs
                .unwrap_or(DEFAULT_FIRST_CHUNK_TIMEOUT_SECS),
        )
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Every field set to its default, for writing a starter file.
    pub fn with_defaults() -> Self {
        Self {
            host: Some(DEFAULT_HOST.to_string()),
            port: Some(DEFAULT_PORT),
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            first_chunk_timeout_secs: Some(DEFAULT_FIRST_CHUNK_TIMEOUT_SECS),
            max_connections: Some(DEFAULT_MAX_CONNECTIONS),
        }
    }
}

/// Top-level sluice configuration, corresponding to `sluice.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Proxy configuration.
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl SluiceConfig {
    /// Parse a `SluiceConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or a
    /// value has the wrong type.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `SluiceConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    /// Fields explicitly set in `other` win.
    #[must_use]
    pub fn merge(mut self, other: SluiceConfig) -> SluiceConfig {
        let theirs = other.proxy;
        let ours = &mut self.proxy;
        if theirs.host.is_some() {
            ours.host = theirs.host;
        }
        if theirs.port.is_some() {
            ours.port = theirs.port;
        }
        if theirs.connect_timeout_secs.is_some() {
            ours.connect_timeout_secs = theirs.connect_timeout_secs;
        }
        if theirs.idle_timeout_secs.is_some() {
            ours.idle_timeout_secs = theirs.idle_timeout_secs;
        }
        if theirs.first_chunk_timeout_secs.is_some() {
            ours.first_chunk_timeout_secs = theirs.first_chunk_timeout_secs;
        }
        if theirs.max_connections.is_some() {
            ours.max_connections = theirs.max_connections;
        }
        self
    }

    /// Config written by `sluice config init`.
    pub fn starter() -> Self {
        Self {
            proxy: ProxySettings::with_defaults(),
        }
    }
}
