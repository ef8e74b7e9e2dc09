//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Transport settings shared by clients and the service
    #[serde(default)]
    pub transport: TransportConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Which channel technology carries the messages
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// System-wide System V message-queue pair (Linux)
    MessageQueue,
    /// Duplex local socket / named pipe with one instance per client
    Pipe,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Backend::MessageQueue
        } else {
            Backend::Pipe
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::MessageQueue => write!(f, "message_queue"),
            Backend::Pipe => write!(f, "pipe"),
        }
    }
}

/// Transport settings
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Backend selected once at endpoint construction
    #[serde(default)]
    pub backend: Backend,

    /// Upper bound on any thread join during stop/close
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Pause between stale-message drain attempts
    #[serde(default = "default_drain_pause")]
    pub drain_pause_ms: u64,

    /// Maximum number of stale messages discarded by one drain
    #[serde(default = "default_drain_max")]
    pub drain_max_messages: usize,

    /// Message-queue backend settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Pipe backend settings
    #[serde(default)]
    pub pipe: PipeConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            drain_pause_ms: default_drain_pause(),
            drain_max_messages: default_drain_max(),
            queue: QueueConfig::default(),
            pipe: PipeConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn drain_pause(&self) -> Duration {
        Duration::from_millis(self.drain_pause_ms)
    }
}

fn default_shutdown_timeout() -> u64 {
    5_000
}
fn default_drain_pause() -> u64 {
    1
}
fn default_drain_max() -> usize {
    4_096
}

/// System V queue keys, one per direction
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_to_server_key")]
    pub to_server_key: i32,

    #[serde(default = "default_to_client_key")]
    pub to_client_key: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            to_server_key: default_to_server_key(),
            to_client_key: default_to_client_key(),
        }
    }
}

fn default_to_server_key() -> i32 {
    0x2a02_0467
}
fn default_to_client_key() -> i32 {
    0x5402_0467
}

/// Local socket / named pipe settings
#[derive(Debug, Deserialize, Clone)]
pub struct PipeConfig {
    /// Override for the well-known pipe name (socket path on Unix)
    #[serde(default)]
    pub name: Option<String>,

    /// Once a frame has started, the rest must arrive within this window
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,

    /// How long a client keeps retrying while the service is absent
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            name: None,
            frame_timeout_ms: default_frame_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl PipeConfig {
    /// Resolved pipe name: the configured override or the platform default
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(super::paths::pipe_name)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_frame_timeout() -> u64 {
    30_000
}
fn default_connect_timeout() -> u64 {
    5_000
}

/// Daemon configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// File name of the daemon log inside the log directory
    #[serde(default = "default_log_file")]
    pub log_file_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file_name: default_log_file(),
        }
    }
}

fn default_log_file() -> String {
    "dxipc-daemon.log".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}
