//! Configuration management for the remote agent.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/remote-agent/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("idle_timeout_ms must be at least 1, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("input_wait_timeout_ms must be at least 1, got {0}")]
    InvalidInputWaitTimeout(u64),

    #[error("retransmit_interval_ms must be between 10 and 60000, got {0}")]
    InvalidRetransmitInterval(u64),

    #[error("api_version must be at least 1, got {0}")]
    InvalidApiVersion(u32),

    #[error("hostname must not be empty")]
    EmptyHostname,

    #[error("room_url must start with ws:// or wss://, got {0}")]
    InvalidRoomUrl(String),

    #[error("socket_addr must be host:port, got {0}")]
    InvalidSocketAddr(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} must be set to reach the control plane")]
    MissingCredential(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General agent configuration.
    pub agent: AgentConfig,

    /// Control plane endpoint and credentials.
    pub control: ControlConfig,

    /// Transport selection and delivery tuning.
    pub transport: TransportConfig,

    /// Terminal session defaults.
    pub terminal: TerminalConfig,
}

/// General agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory for agent data (log files).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write a daily-rotated log file under `data_dir/logs`.
    pub log_to_file: bool,
}

/// Control plane endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Control plane host, optionally with a port.
    pub hostname: String,

    /// Use https/wss when deriving URLs from `hostname`.
    pub tls: bool,

    /// API version segment in `/api/v{n}`.
    pub api_version: u32,

    /// Client identifier; also the room the agent joins.
    pub client_id: String,

    /// API key paired with `client_id`.
    pub api_key: String,

    /// Explicit WebSocket URL for the room link. Derived from `hostname`
    /// when empty.
    pub room_url: String,

    /// Address of the raw socket link (`socket` transport).
    pub socket_addr: String,
}

/// Which transport carries requests, responses and pushes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebSocket broadcast room, with consume-confirmations.
    #[default]
    Room,
    /// Framed TCP link.
    Socket,
    /// HTTP callbacks for pushes and responses, room link for requests.
    Http,
}

/// Transport selection and delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// Interval between retransmissions of unconfirmed output chunks.
    pub retransmit_interval_ms: u64,

    /// Timeout for a single HTTP callback.
    pub request_timeout_secs: u64,

    /// First reconnect delay for room and socket links.
    pub initial_backoff_ms: u64,

    /// Upper bound for the reconnect delay.
    pub max_backoff_ms: u64,
}

/// Terminal session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell spawned by `connect`.
    pub default_shell: String,

    pub default_cols: u16,
    pub default_rows: u16,

    /// Working directory for new shells. Home directory when unset.
    pub default_cwd: Option<PathBuf>,

    /// Inactivity window before a session is reclaimed.
    pub idle_timeout_ms: u64,

    /// How long a `data` call waits for its turn.
    pub input_wait_timeout_ms: u64,

    /// Maximum number of live shell processes.
    pub max_sessions: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost:8080".to_string(),
            tls: false,
            api_version: 1,
            client_id: String::new(),
            api_key: String::new(),
            room_url: String::new(),
            socket_addr: "127.0.0.1:7070".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Room,
            retransmit_interval_ms: 1000,
            request_timeout_secs: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cols: 120,
            default_rows: 80,
            default_cwd: None,
            idle_timeout_ms: 3_600_000,
            input_wait_timeout_ms: 30_000,
            max_sessions: 64,
        }
    }
}

impl ControlConfig {
    /// Base URL of the REST API: `{scheme}://{hostname}/api/v{n}`.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}/api/v{}", scheme, self.hostname, self.api_version)
    }

    /// WebSocket URL of the room link.
    pub fn room_url(&self) -> String {
        if !self.room_url.is_empty() {
            return self.room_url.clone();
        }
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}/api/v{}/client/link",
            scheme, self.hostname, self.api_version
        )
    }

    /// `base64("{api_key}:{client_id}")`.
    pub fn client_key(&self) -> String {
        protocol::client_key(&self.api_key, &self.client_id)
    }

    /// Fail unless both halves of the client key are present.
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingCredential("control.client_id"));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingCredential("control.api_key"));
        }
        Ok(())
    }
}

impl TransportConfig {
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn input_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.input_wait_timeout_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-agent")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-agent")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Read a non-empty environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - REMOTE_AGENT_LOG_LEVEL
    /// - REMOTE_AGENT_HOSTNAME
    /// - REMOTE_AGENT_CLIENT_ID
    /// - REMOTE_AGENT_API_KEY
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_override("REMOTE_AGENT_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.agent.log_level = level;
        }

        if let Some(hostname) = env_override("REMOTE_AGENT_HOSTNAME") {
            tracing::info!("Overriding hostname from environment: {}", hostname);
            self.control.hostname = hostname;
        }

        if let Some(client_id) = env_override("REMOTE_AGENT_CLIENT_ID") {
            tracing::info!("Overriding client_id from environment");
            self.control.client_id = client_id;
        }

        if let Some(api_key) = env_override("REMOTE_AGENT_API_KEY") {
            tracing::info!("Overriding api_key from environment");
            self.control.api_key = api_key;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let terminal = &self.terminal;
        if terminal.max_sessions < 1 || terminal.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(terminal.max_sessions));
        }

        if terminal.default_cols == 0 || terminal.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: terminal.default_cols,
                rows: terminal.default_rows,
            });
        }

        if terminal.idle_timeout_ms == 0 {
            return Err(ConfigError::InvalidIdleTimeout(terminal.idle_timeout_ms));
        }

        if terminal.input_wait_timeout_ms == 0 {
            return Err(ConfigError::InvalidInputWaitTimeout(
                terminal.input_wait_timeout_ms,
            ));
        }

        let interval = self.transport.retransmit_interval_ms;
        if !(10..=60_000).contains(&interval) {
            return Err(ConfigError::InvalidRetransmitInterval(interval));
        }

        if self.control.api_version < 1 {
            return Err(ConfigError::InvalidApiVersion(self.control.api_version));
        }

        if self.control.hostname.is_empty() {
            return Err(ConfigError::EmptyHostname);
        }

        let room_url = &self.control.room_url;
        if !room_url.is_empty() && !room_url.starts_with("ws://") && !room_url.starts_with("wss://")
        {
            return Err(ConfigError::InvalidRoomUrl(room_url.clone()));
        }

        if self.transport.kind == TransportKind::Socket {
            let addr = &self.control.socket_addr;
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::InvalidSocketAddr(addr.clone()));
            }
        }

        let shell_path = Path::new(&terminal.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&terminal.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(terminal.default_shell.clone()));
        }

        let level = self.agent.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.agent.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
