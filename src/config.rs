//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::backoff::Backoff;
use crate::session::endpoint::{self, DEFAULT_PATH};
use crate::session::error::{SessionError, SessionResult};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Push-channel session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Explicit WebSocket URL; wins over `page_origin` + `path`
    #[serde(default)]
    pub url: Option<String>,

    /// Page origin the endpoint is derived from
    #[serde(default = "default_page_origin")]
    pub page_origin: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_cap_delay")]
    pub cap_delay_ms: u64,

    /// 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Longest a single outbound frame may take to write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Capacity of the session event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_page_origin() -> String {
    "http://localhost:8082".to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_base_delay() -> u64 {
    1000
}

fn default_cap_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_close_timeout() -> u64 {
    2000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: None,
            page_origin: default_page_origin(),
            path: default_path(),
            base_delay_ms: default_base_delay(),
            cap_delay_ms: default_cap_delay(),
            max_reconnect_attempts: default_max_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            close_timeout_ms: default_close_timeout(),
            write_timeout_ms: default_write_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SessionConfig {
    /// Config for an explicit WebSocket URL, defaults elsewhere
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Check intervals and delays for values the supervisor cannot work with
    pub fn validate(&self) -> SessionResult<()> {
        if self.base_delay_ms == 0 {
            return Err(SessionError::Config("base_delay_ms must be positive".into()));
        }
        if self.cap_delay_ms < self.base_delay_ms {
            return Err(SessionError::Config(format!(
                "cap_delay_ms ({}) is below base_delay_ms ({})",
                self.cap_delay_ms, self.base_delay_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms == 0 {
            return Err(SessionError::Config(
                "heartbeat interval and timeout must be positive".into(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(SessionError::Config(
                "connect and write timeouts must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::Config("event_capacity must be positive".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            tracing::warn!(
                interval_ms = self.heartbeat_interval_ms,
                timeout_ms = self.heartbeat_timeout_ms,
                "Heartbeat timeout does not exceed the ping interval; quiet connections may be flagged stale"
            );
        }
        Ok(())
    }

    /// The WebSocket endpoint this session connects to
    pub fn endpoint(&self) -> SessionResult<url::Url> {
        match &self.url {
            Some(url) => endpoint::parse_websocket_url(url),
            None => endpoint::websocket_url(&self.page_origin, &self.path),
        }
    }

    pub fn backoff(&self) -> Backoff {
        let max_attempts = match self.max_reconnect_attempts {
            0 => None,
            n => Some(n),
        };
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.cap_delay_ms),
            max_attempts,
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
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

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
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
            dirs::config_dir().map(|p| p.join("pulse-link").join("config.toml")),
            Some(PathBuf::from("./pulse-link.toml")),
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

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.session.endpoint()?;
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let session = &mut self.session;

        if let Some(url) = lookup("PULSE_LINK_URL") {
            session.url = Some(url);
        }
        if let Some(origin) = lookup("PULSE_LINK_ORIGIN") {
            session.page_origin = origin;
        }
        if let Some(v) = lookup("PULSE_LINK_BASE_DELAY_MS").and_then(|s| s.parse().ok()) {
            session.base_delay_ms = v;
        }
        if let Some(v) = lookup("PULSE_LINK_CAP_DELAY_MS").and_then(|s| s.parse().ok()) {
            session.cap_delay_ms = v;
        }
        if let Some(v) = lookup("PULSE_LINK_MAX_ATTEMPTS").and_then(|s| s.parse().ok()) {
            session.max_reconnect_attempts = v;
        }
        if let Some(v) = lookup("PULSE_LINK_HEARTBEAT_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            session.heartbeat_interval_ms = v;
        }
        if let Some(v) = lookup("PULSE_LINK_HEARTBEAT_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            session.heartbeat_timeout_ms = v;
        }

        if let Some(level) = lookup("PULSE_LINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("PULSE_LINK_LOG_FORMAT") {
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

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] SessionError),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Pulse Link Configuration
#
# Environment variables override these settings:
# - PULSE_LINK_URL
# - PULSE_LINK_ORIGIN
# - PULSE_LINK_BASE_DELAY_MS
# - PULSE_LINK_CAP_DELAY_MS
# - PULSE_LINK_MAX_ATTEMPTS
# - PULSE_LINK_HEARTBEAT_INTERVAL_MS
# - PULSE_LINK_HEARTBEAT_TIMEOUT_MS
# - PULSE_LINK_LOG_LEVEL
# - PULSE_LINK_LOG_FORMAT

[session]
# Explicit endpoint; when unset it is derived from page_origin + path
# url = "ws://localhost:8082/ws"

# Page origin (http -> ws, https -> wss)
page_origin = "http://localhost:8082"
path = "/ws"

# Reconnect backoff: min(base * 2^attempt, cap)
base_delay_ms = 1000
cap_delay_ms = 30000

# Give up after this many failed attempts (0 = never)
max_reconnect_attempts = 10

# Heartbeat cadence and inbound-silence timeout
heartbeat_interval_ms = 30000
heartbeat_timeout_ms = 60000

connect_timeout_ms = 10000
close_timeout_ms = 2000

# A write stalled longer than this drops the connection
write_timeout_ms = 10000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
