//! Configuration module for the broadcast hub.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the broadcast hub
#[derive(Parser, Debug)]
#[command(name = "broadcast-hub")]
#[command(author = "broadcast-hub authors")]
#[command(version = "0.1.0")]
#[command(about = "A WebSocket broadcast hub", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Seconds allowed for the WebSocket upgrade (0 = unlimited)
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Do not echo a broadcast back to the client that sent it
    #[arg(long)]
    pub exclude_sender: bool,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog passed to the socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Idle timeout in seconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout: u64,
    /// Time allowed for the WebSocket upgrade in seconds (0 = unlimited)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            idle_timeout: 0,
            handshake_timeout: default_handshake_timeout(),
            workers: None,
        }
    }
}

/// Broadcast policy configuration
#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    /// Whether the sender receives its own broadcast
    #[serde(default = "default_include_sender")]
    pub include_sender: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            include_sender: default_include_sender(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_include_sender() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub backlog: i32,
    /// `None` when idle connections are kept forever.
    pub idle_timeout: Option<Duration>,
    /// `None` when the upgrade may take arbitrarily long.
    pub handshake_timeout: Option<Duration>,
    pub workers: Option<usize>,
    pub include_sender: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from parsed CLI args.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        let idle_secs = cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout);
        let handshake_secs = cli
            .handshake_timeout
            .unwrap_or(toml_config.server.handshake_timeout);

        Ok(Config {
            listen,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections)
                .max(1),
            backlog: toml_config.server.backlog,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            handshake_timeout: (handshake_secs > 0).then(|| Duration::from_secs(handshake_secs)),
            workers: cli.workers.or(toml_config.server.workers),
            include_sender: !cli.exclude_sender && toml_config.broadcast.include_sender,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_connections: server.max_connections,
            backlog: server.backlog,
            idle_timeout: None,
            handshake_timeout: Some(Duration::from_secs(server.handshake_timeout)),
            workers: None,
            include_sender: default_include_sender(),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': {1}")]
    InvalidListen(String, #[source] std::net::AddrParseError),
}
