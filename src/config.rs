//! Configuration types for Geofetch

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::network::{
    DEFAULT_LOCAL_TIMEOUT_SECS, DEFAULT_POOL_SIZE, DEFAULT_REMOTE_TIMEOUT_SECS,
};
use crate::{GeofetchError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker and per-host connection limits
    #[serde(default)]
    pub pool: PoolConfig,
    /// Outbound request defaults
    #[serde(default)]
    pub client: ClientConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Default `tracing` filter directive for [`crate::logging::init`]
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            client: ClientConfig::default(),
            limits: LimitsConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers, and connections kept per host
    pub size: usize,
    /// Connect/exchange timeout for loopback hosts, in seconds
    pub local_timeout_secs: u64,
    /// Connect/exchange timeout for all other hosts, in seconds
    pub remote_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            local_timeout_secs: DEFAULT_LOCAL_TIMEOUT_SECS,
            remote_timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

impl PoolConfig {
    /// Timeout for loopback destinations
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    /// Timeout for remote destinations
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

/// Headers sent with every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `User-Agent` header value
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Additional headers applied before per-request headers
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            extra_headers: BTreeMap::new(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum response body size in bytes
    pub max_response_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_response_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GeofetchError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns error if the text cannot be parsed or is invalid
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GeofetchError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(GeofetchError::ConfigError(
                "pool.size must be > 0".to_string(),
            ));
        }

        if self.pool.local_timeout_secs == 0 || self.pool.remote_timeout_secs == 0 {
            return Err(GeofetchError::ConfigError(
                "pool timeouts must be > 0".to_string(),
            ));
        }

        if self.limits.max_response_size == 0 {
            return Err(GeofetchError::ConfigError(
                "limits.max_response_size must be > 0".to_string(),
            ));
        }

        HeaderValue::from_str(&self.client.user_agent).map_err(|e| {
            GeofetchError::ConfigError(format!("client.user_agent is not a valid header: {e}"))
        })?;

        for (name, value) in &self.client.extra_headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                GeofetchError::ConfigError(format!("Invalid header name '{name}': {e}"))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                GeofetchError::ConfigError(format!("Invalid value for header '{name}': {e}"))
            })?;
        }

        Ok(())
    }
}
