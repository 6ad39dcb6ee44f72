//! Configuration for the notification subsystem
//!
//! Endpoints, reconnect backoff, periodic pull and acknowledgement batching.
//! Every section has defaults so a partial TOML file is enough.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "HIREWIRE_CONFIG";

/// System-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Backend endpoints
    pub service: ServiceConfig,
    /// Push channel reconnect policy
    pub reconnect: ReconnectConfig,
    /// Periodic pull settings
    pub refresh: RefreshConfig,
    /// Read acknowledgement settings
    pub ack: AckConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// REST base, e.g. `https://api.example.com/api`
    pub base_url: String,
    /// Push channel endpoint
    pub push_url: String,
    /// Per-request timeout for pull and acknowledgement calls
    pub request_timeout_secs: u64,
    /// Event kind carrying new notifications on the push channel
    pub notification_event: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000/api".to_string(),
            push_url: "ws://127.0.0.1:5000/ws".to_string(),
            request_timeout_secs: 30,
            notification_event: "new_notification".to_string(),
        }
    }
}

/// Push channel reconnect configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a drop
    pub initial_delay_ms: u64,
    /// Upper bound for the delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Periodic pull configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Interval between full pulls
    pub interval_secs: u64,
    /// Pull again whenever the push channel comes back, to cover the gap
    pub refresh_on_reconnect: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            refresh_on_reconnect: true,
        }
    }
}

/// Read acknowledgement configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// Ids per acknowledgement request; 1 sends one request per id
    pub batch_size: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self { batch_size: 1 }
    }
}

impl NotifyConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load and validate a TOML file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default location: `<config dir>/hirewire/notify.toml`
    pub fn standard_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hirewire").join("notify.toml"))
    }

    /// Load from `$HIREWIRE_CONFIG`, then the standard location, else defaults
    pub fn load_standard() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            tracing::debug!("Loading notification config from {}", path);
            return Self::load_from_path(path);
        }

        match Self::standard_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading notification config from {:?}", path);
                Self::load_from_path(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(&self.service.base_url, &["http", "https"])?;
        check_url(&self.service.push_url, &["ws", "wss"])?;

        if self.service.notification_event.trim().is_empty() {
            return Err(ConfigError::MissingField(
                "service.notification_event".to_string(),
            ));
        }

        if self.service.request_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "request_timeout_secs must be positive".to_string(),
            ));
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "initial_delay_ms must be positive".to_string(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::OutOfRange(
                "max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }

        if !(self.reconnect.multiplier >= 1.0) {
            return Err(ConfigError::OutOfRange(
                "multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.refresh.interval_secs == 0 {
            return Err(ConfigError::OutOfRange(
                "refresh interval_secs must be positive".to_string(),
            ));
        }

        if self.ack.batch_size == 0 {
            return Err(ConfigError::OutOfRange(
                "ack batch_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{raw}: {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidUrl(format!(
            "{raw}: expected scheme {}",
            schemes.join(" or ")
        )));
    }
    Ok(())
}

/// Configuration loading or validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Endpoint is not a usable URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Value is out of valid range
    #[error("Value out of range: {0}")]
    OutOfRange(String),
    /// Required field is missing
    #[error("Missing field: {0}")]
    MissingField(String),
    /// File could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
    /// File could not be read
    #[error("IO error: {0}")]
    Io(String),
}
