//! Configuration module for the accept-router server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// How new connections are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Pick the protocol from the first byte the client sends.
    Sniff,
    /// Require a `PROTO <name>\r\n` line before any protocol traffic.
    Preamble,
}

/// Command-line arguments for the router
#[derive(Parser, Debug)]
#[command(name = "accept-router")]
#[command(author = "accept-router authors")]
#[command(version = "0.1.0")]
#[command(about = "Accept-time protocol router", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// How to classify new connections
    #[arg(short = 'm', long, value_enum)]
    pub routing_mode: Option<RoutingMode>,

    /// Milliseconds a connection may take to send routing data (0 = no limit)
    #[arg(long)]
    pub routing_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub protocols: ProtocolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Queued response bytes per connection before reads pause
    #[serde(default = "default_write_backlog")]
    pub write_backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            write_backlog: default_write_backlog(),
        }
    }
}

/// Routing-related configuration
#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_routing_mode")]
    pub mode: RoutingMode,
    /// Partial-data timeout in milliseconds
    #[serde(default = "default_routing_timeout_ms")]
    pub timeout_ms: u64,
    /// Bytes buffered before routing gives up
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: default_routing_mode(),
            timeout_ms: default_routing_timeout_ms(),
            max_buffer: default_max_buffer(),
        }
    }
}

/// Downstream protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolsConfig {
    /// Largest payload the echo protocol accepts
    #[serde(default = "default_max_echo_size")]
    pub max_echo_size: usize,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            max_echo_size: default_max_echo_size(),
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
    "127.0.0.1:7070".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_write_backlog() -> usize {
    256 * 1024
}

fn default_routing_mode() -> RoutingMode {
    RoutingMode::Sniff
}

fn default_routing_timeout_ms() -> u64 {
    5_000
}

fn default_max_buffer() -> usize {
    4096
}

fn default_max_echo_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub backlog: i32,
    pub write_backlog: usize,
    pub routing_mode: RoutingMode,
    pub routing_timeout_ms: u64,
    pub max_routing_buffer: usize,
    pub max_echo_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Zero("workers"));
        }
        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }

        Ok(Config {
            listen,
            workers,
            max_connections,
            backlog: toml_config.server.backlog,
            write_backlog: toml_config.server.write_backlog,
            routing_mode: cli.routing_mode.unwrap_or(toml_config.routing.mode),
            routing_timeout_ms: cli
                .routing_timeout_ms
                .unwrap_or(toml_config.routing.timeout_ms),
            max_routing_buffer: toml_config.routing.max_buffer,
            max_echo_size: toml_config.protocols.max_echo_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Partial-data timeout, `None` when disabled.
    pub fn routing_timeout(&self) -> Option<Duration> {
        (self.routing_timeout_ms > 0).then(|| Duration::from_millis(self.routing_timeout_ms))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, AddrParseError),
    /// A setting that must be at least 1 was 0.
    Zero(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::Zero(name) => {
                write!(f, "Invalid {}: must be greater than 0", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
