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
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Real-time session configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// WebSocket URI of the server
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Initial backoff unit
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Hard ceiling on the computed backoff
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Retries before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Keep-alive period while connected
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_endpoint() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl SessionConfig {
    /// Session config for `endpoint` with default timings
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Check the values the connection manager relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ConfigError::Invalid {
            field: "endpoint",
            reason: format!("{} ({})", e, self.endpoint),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("scheme must be ws or wss, got {}", url.scheme()),
            });
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "base_delay_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "max_delay_ms",
                reason: format!("must be at least base_delay_ms ({})", self.base_delay_ms),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
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

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
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
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("agrolink").join("config.toml")),
            Some(PathBuf::from("/etc/agrolink/config.toml")),
            Some(PathBuf::from("./agrolink.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup; unparseable numbers are ignored
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Session overrides
        if let Some(endpoint) = lookup("AGROLINK_ENDPOINT") {
            self.session.endpoint = endpoint;
        }
        if let Some(v) = lookup("AGROLINK_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.session.base_delay_ms = v;
        }
        if let Some(v) = lookup("AGROLINK_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.session.max_delay_ms = v;
        }
        if let Some(v) = lookup("AGROLINK_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.session.max_attempts = v;
        }
        if let Some(v) = lookup("AGROLINK_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.session.heartbeat_interval_ms = v;
        }

        // Logging overrides
        if let Some(level) = lookup("AGROLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("AGROLINK_LOG_FORMAT") {
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

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Agrolink Configuration
#
# Environment variables override these settings:
# - AGROLINK_ENDPOINT
# - AGROLINK_BASE_DELAY_MS
# - AGROLINK_MAX_DELAY_MS
# - AGROLINK_MAX_ATTEMPTS
# - AGROLINK_HEARTBEAT_INTERVAL_MS
# - AGROLINK_LOG_LEVEL
# - AGROLINK_LOG_FORMAT

[session]
# WebSocket URI of the real-time server
endpoint = "ws://localhost:8080/ws"

# First reconnect delay; doubles on every retry (ms)
base_delay_ms = 1000

# Ceiling on the reconnect delay (ms)
max_delay_ms = 30000

# Retries before the connection gives up (0 = never retry)
max_attempts = 5

# Keep-alive period while connected (ms)
heartbeat_interval_ms = 30000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
