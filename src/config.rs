//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8087
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Service-variant relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// How long a client connection waits for an upstream to pair with
    /// before it is failed
    #[serde(default = "default_upstream_wait")]
    pub upstream_wait_secs: u64,

    /// Protocol versions accepted from the upstream handshake
    #[serde(default = "default_protocol_versions")]
    pub supported_protocol_versions: Vec<i64>,
}

fn default_upstream_wait() -> u64 {
    30
}

fn default_protocol_versions() -> Vec<i64> {
    vec![1]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_wait_secs: default_upstream_wait(),
            supported_protocol_versions: default_protocol_versions(),
        }
    }
}

/// Hub-variant configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Route the hub is mounted at; its negotiate endpoint hangs off it
    #[serde(default = "default_hub_path")]
    pub path: String,

    /// Codec names accepted from the hub handshake
    #[serde(default = "default_hub_protocols")]
    pub supported_protocols: Vec<String>,
}

fn default_hub_path() -> String {
    "/chat".to_string()
}

fn default_hub_protocols() -> Vec<String> {
    vec!["json".to_string()]
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            path: default_hub_path(),
            supported_protocols: default_hub_protocols(),
        }
    }
}

/// Per-connection behavior
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Keepalive ping interval for negotiated connections
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Maximum number of concurrently registered connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("wirehub").join("config.toml")),
            Some(PathBuf::from("/etc/wirehub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("WIREHUB_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("WIREHUB_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(wait) = std::env::var("WIREHUB_UPSTREAM_WAIT_SECS") {
            if let Ok(w) = wait.parse() {
                self.relay.upstream_wait_secs = w;
            }
        }

        if let Ok(path) = std::env::var("WIREHUB_HUB_PATH") {
            self.hub.path = path;
        }

        if let Ok(interval) = std::env::var("WIREHUB_KEEPALIVE_SECS") {
            if let Ok(i) = interval.parse() {
                self.connection.keepalive_interval_secs = i;
            }
        }
        if let Ok(max) = std::env::var("WIREHUB_MAX_CONNECTIONS") {
            if let Ok(m) = max.parse() {
                self.connection.max_connections = m;
            }
        }

        if let Ok(level) = std::env::var("WIREHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WIREHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Wirehub Configuration
#
# Environment variables override these settings:
# - WIREHUB_HOST
# - WIREHUB_PORT
# - WIREHUB_UPSTREAM_WAIT_SECS
# - WIREHUB_HUB_PATH
# - WIREHUB_KEEPALIVE_SECS
# - WIREHUB_MAX_CONNECTIONS
# - WIREHUB_LOG_LEVEL
# - WIREHUB_LOG_FORMAT

[server]
# Listener host
host = "127.0.0.1"

# Listener port
port = 8087

[relay]
# How long a client connection waits for an upstream before failing (seconds)
upstream_wait_secs = 30

# Accepted upstream handshake protocol versions
supported_protocol_versions = [1]

[hub]
# Route the hub is mounted at
path = "/chat"

# Accepted hub handshake protocols
supported_protocols = ["json"]

[connection]
# Keepalive ping interval (seconds)
keepalive_interval_secs = 10

# Maximum concurrently registered connections
max_connections = 1000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
