//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GRAPHWIRE_CONFIG)
//! 3. Environment variables

use graphwire_protocol::chunk::MIN_BUFFER_SIZE;
use graphwire_protocol::{FramingConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "GRAPHWIRE_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Framing and execution configuration.
    pub transport: TransportConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides read through `lookup`, keyed by environment
    /// variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.transport.apply_overrides(&lookup);
        self.metrics.apply_overrides(&lookup);
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        self.transport.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Time allowed for the client handshake in seconds.
    pub handshake_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            handshake_timeout_secs: 10,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_parsed(lookup, "GRAPHWIRE_BIND", &mut self.bind_addr);
        override_parsed(lookup, "GRAPHWIRE_IDLE_TIMEOUT", &mut self.idle_timeout_secs);
        override_parsed(
            lookup,
            "GRAPHWIRE_HANDSHAKE_TIMEOUT",
            &mut self.handshake_timeout_secs,
        );
        override_parsed(lookup, "GRAPHWIRE_MAX_CONNECTIONS", &mut self.max_connections);
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns handshake timeout as Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Where request execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// On the connection's I/O task, inside `handle()`.
    ///
    /// The session must not block: while it runs, the connection's reads
    /// stop. On a multi-threaded runtime the server moves the call onto a
    /// blocking section; on a current-thread runtime every connection
    /// waits for it.
    Inline,
    /// On a dedicated worker thread per connection.
    #[default]
    Worker,
}

impl std::str::FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(ExecutionMode::Inline),
            "worker" => Ok(ExecutionMode::Worker),
            other => Err(ConfigError::Validation(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Framing and execution configuration.
///
/// Buffer and message sizes default to the negotiated protocol version's
/// framing; setting them here overrides that for every version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of the outbound send buffer in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<usize>,
    /// Size of a single socket read in bytes.
    pub read_buffer_size: usize,
    /// Largest inbound message accepted, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// Where requests are executed.
    pub execution: ExecutionMode,
    /// Time to wait for in-flight work after the client stops sending, in
    /// seconds.
    pub drain_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: None,
            read_buffer_size: 8192,
            max_message_size: None,
            execution: ExecutionMode::default(),
            drain_timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_optional(
            lookup,
            "GRAPHWIRE_OUTPUT_BUFFER_SIZE",
            &mut self.output_buffer_size,
        );
        override_parsed(lookup, "GRAPHWIRE_READ_BUFFER_SIZE", &mut self.read_buffer_size);
        override_optional(lookup, "GRAPHWIRE_MAX_MESSAGE_SIZE", &mut self.max_message_size);
        override_parsed(lookup, "GRAPHWIRE_EXECUTION", &mut self.execution);
        override_parsed(lookup, "GRAPHWIRE_DRAIN_TIMEOUT", &mut self.drain_timeout_secs);
    }

    /// Returns `framing` with the configured overrides applied.
    pub fn framing_for(&self, framing: FramingConfig) -> FramingConfig {
        FramingConfig {
            output_buffer_size: self.output_buffer_size.unwrap_or(framing.output_buffer_size),
            max_message_size: self.max_message_size.unwrap_or(framing.max_message_size),
            ..framing
        }
    }

    /// Returns drain timeout as Duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.output_buffer_size.is_some_and(|size| size < MIN_BUFFER_SIZE) {
            return Err(ConfigError::Validation(format!(
                "transport.output_buffer_size must be at least {}",
                MIN_BUFFER_SIZE
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "transport.read_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_message_size == Some(0) {
            return Err(ConfigError::Validation(
                "transport.max_message_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("GRAPHWIRE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        override_parsed(lookup, "GRAPHWIRE_METRICS_BIND", &mut self.bind_addr);
    }
}

/// Replaces `target` with the parsed value of `key`, ignoring values that
/// fail to parse.
fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {}", key, value),
        }
    }
}

fn override_optional<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut Option<T>,
) {
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(parsed) => *target = Some(parsed),
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {}", key, value),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
