//! # Configuration Management
//!
//! Centralized configuration for servers, clients and individual links.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (prefix `PEER_LINK_`)
//! - Direct instantiation with defaults
//!
//! The process bootstrap layer owns these values and hands them to
//! connections and peers at construction; nothing in the crate reads
//! configuration from global state.

use crate::core::stream::StreamMode;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default receive buffer capacity, which is also the largest accepted frame (64KB)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// Default size of one wire buffer block (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = crate::core::buffer::DEFAULT_BLOCK_SIZE;

/// Default number of channels per link, control channel included
pub const DEFAULT_CHANNEL_TABLE_SIZE: usize = 256;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-link transport and protocol settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEER_LINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("PEER_LINK_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(size) = std::env::var("PEER_LINK_RECEIVE_BUFFER_SIZE") {
            config.link.receive_buffer_size = size.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PEER_LINK_RECEIVE_BUFFER_SIZE: {e}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("PEER_LINK_REQUEST_TIMEOUT_MS") {
            let millis = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PEER_LINK_REQUEST_TIMEOUT_MS: {e}"))
            })?;
            config.link.request_timeout = Duration::from_millis(millis);
        }

        if let Ok(size) = std::env::var("PEER_LINK_CHANNEL_TABLE_SIZE") {
            config.link.channel_table_size = size.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PEER_LINK_CHANNEL_TABLE_SIZE: {e}"))
            })?;
        }

        if let Ok(max) = std::env::var("PEER_LINK_MAX_CONNECTIONS") {
            config.server.max_connections = max.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid PEER_LINK_MAX_CONNECTIONS: {e}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.link.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:7400")
    pub address: String,

    /// Maximum number of concurrent links
    pub max_connections: usize,

    /// Time to wait for links to wind down on shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7400"),
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:7400')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target peer address
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7400"),
            connect_timeout: timeout::CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Per-link settings shared by both ends of a connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Fixed receive buffer capacity; the largest frame (prefix included) a peer may send
    pub receive_buffer_size: usize,

    /// Size of one wire buffer block
    pub block_size: usize,

    /// Default deadline for tracked requests
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Number of channel slots, control channel included
    pub channel_table_size: usize,

    /// Failure reporting mode for frame decoders
    #[serde(default)]
    pub stream_mode: StreamMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            request_timeout: timeout::DEFAULT_TIMEOUT,
            channel_table_size: DEFAULT_CHANNEL_TABLE_SIZE,
            stream_mode: StreamMode::Strict,
        }
    }
}

impl LinkConfig {
    /// Validate link configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.receive_buffer_size < 64 {
            errors.push("Receive buffer too small (minimum: 64 bytes)".to_string());
        } else if self.receive_buffer_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Receive buffer too large: {} bytes (maximum: 64 MB)",
                self.receive_buffer_size
            ));
        }

        if self.block_size == 0 {
            errors.push("Block size must be greater than 0".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if !(2..=256).contains(&self.channel_table_size) {
            errors.push(format!(
                "Invalid channel table size: {} (valid range: 2-256)",
                self.channel_table_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-link"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        }

        if self.log_to_file && self.log_file_path.is_none() {
            errors.push("log_file_path must be specified when log_to_file is true".to_string());
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
