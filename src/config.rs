//! Interceptor configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Interceptor and proxy front-end configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Version label of the interceptor being registered
    pub version: String,
    /// Request immediate activation at install
    pub skip_waiting: bool,
    /// Request immediate client claim at activation
    pub claim_clients: bool,
    /// Bind address (e.g., "127.0.0.1")
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Optional per-request network timeout. No timeout when unset.
    pub fetch_timeout_ms: Option<u64>,
    /// Directory for rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            skip_waiting: true,
            claim_clients: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9191,
            fetch_timeout_ms: None,
            log_dir: None,
        }
    }
}

pub fn create_default_config() -> InterceptorConfig {
    InterceptorConfig::default()
}

impl InterceptorConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "fetch_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
