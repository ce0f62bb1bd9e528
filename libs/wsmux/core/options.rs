//! Runtime options for clients and servers
//!
//! Both option sets deserialize from YAML with defaults for every field, so an
//! empty file is a valid configuration. `load` reads the file, applies the
//! environment overrides and validates, in that order.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Override for [`ClientOptions::url`]
pub const ENV_URL: &str = "WSMUX_URL";
/// Override for [`ServerOptions::host`]
pub const ENV_BIND_HOST: &str = "WSMUX_BIND_HOST";
/// Override for [`ServerOptions::port`]
pub const ENV_BIND_PORT: &str = "WSMUX_BIND_PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// What `send()` does before the handshake has completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PendingSendPolicy {
    /// Keep the message; it is flushed once Established
    #[default]
    Queue,
    /// Fail with `NotEstablished`
    Reject,
}

/// Ping/Pong liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    /// Time between Pings
    pub interval_ms: u64,
    /// How long a Ping may go unanswered
    pub timeout_ms: u64,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "keepalive.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "keepalive.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Target URL, used by `connect()` when set
    #[serde(default)]
    pub url: Option<String>,
    /// Bound on the close handshake and on `disconnect()`
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default)]
    pub pending_send: PendingSendPolicy,
    #[serde(default)]
    pub keepalive: Option<KeepAlive>,
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: None,
            close_timeout_ms: default_close_timeout_ms(),
            pending_send: PendingSendPolicy::default(),
            keepalive: None,
            log_level: default_log_level(),
        }
    }
}

impl ClientOptions {
    /// Load from YAML, then apply `WSMUX_URL` and validate
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a custom environment lookup
    pub fn load_with_env<F>(config_path: impl AsRef<Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut options: ClientOptions = serde_yaml::from_str(&yaml_content)?;

        if let Some(url) = env(ENV_URL) {
            info!("Overriding client URL from environment variable");
            options.url = Some(url);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.close_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "close_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::ValidationError(format!(
                    "url must start with ws:// or wss://, got '{}'",
                    url
                )));
            }
        }
        if let Some(keepalive) = &self.keepalive {
            keepalive.validate()?;
        }
        validate_log_level(&self.log_level)
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Client configuration:");
        info!("  URL: {}", self.url.as_deref().unwrap_or("<unset>"));
        info!("  Close timeout: {} ms", self.close_timeout_ms);
        info!("  Pending sends: {:?}", self.pending_send);
        match &self.keepalive {
            Some(k) => info!("  Keepalive: every {} ms, timeout {} ms", k.interval_ms, k.timeout_ms),
            None => info!("  Keepalive: disabled"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOptions {
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Subprotocol echoed back when the client offers it
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Upper bound on concurrent sessions; further peers get HTTP 503
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[serde(default)]
    pub keepalive: Option<KeepAlive>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: None,
            close_timeout_ms: default_close_timeout_ms(),
            max_sessions: None,
            keepalive: None,
            log_level: default_log_level(),
        }
    }
}

impl ServerOptions {
    /// Load from YAML, then apply `WSMUX_BIND_HOST`/`WSMUX_BIND_PORT` and validate
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(config_path: impl AsRef<Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut options: ServerOptions = serde_yaml::from_str(&yaml_content)?;

        if let Some(host) = env(ENV_BIND_HOST) {
            info!("Overriding bind host from environment variable");
            options.host = host;
        }
        if let Some(port) = env(ENV_BIND_PORT) {
            info!("Overriding bind port from environment variable");
            options.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("{} is not a valid port: '{}'", ENV_BIND_PORT, port))
            })?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("host must not be empty".to_string()));
        }
        if self.close_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "close_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_sessions == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_sessions must be greater than 0 when set".to_string(),
            ));
        }
        if let Some(keepalive) = &self.keepalive {
            keepalive.validate()?;
        }
        validate_log_level(&self.log_level)
    }

    pub fn log(&self) {
        info!("Server configuration:");
        info!("  Bind: {}:{}", self.host, self.port);
        info!("  Protocol: {}", self.protocol.as_deref().unwrap_or("<none>"));
        info!("  Close timeout: {} ms", self.close_timeout_ms);
        match self.max_sessions {
            Some(max) => info!("  Max sessions: {}", max),
            None => info!("  Max sessions: unlimited"),
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    let valid_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_levels.contains(&level.to_lowercase().as_str()) {
        return Err(ConfigError::ValidationError(format!(
            "log_level must be one of: {}",
            valid_levels.join(", ")
        )));
    }
    Ok(())
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_log_level() -> String {
    "info".to_string()
}
