//! Configuration module for the framekv server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "framekv")]
#[command(version = "0.1.0")]
#[command(about = "A pipelined key-value server over a length-prefixed binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneously open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Upper bound on how long one poll blocks, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Readiness events handled per poll
    #[arg(long)]
    pub events: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_events")]
    pub events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
            backlog: default_backlog(),
            events: default_events(),
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
    "127.0.0.1:1234".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_backlog() -> i32 {
    1024
}

fn default_events() -> usize {
    1024
}

/// Upper bound on `events`; the batch is allocated up front.
const MAX_EVENTS: usize = 65_536;

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    listen: SocketAddr,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub backlog: i32,
    pub events: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::resolve(cli, toml_config)
    }

    /// CLI values win over file values.
    fn resolve(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(file.server.listen);
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidListen {
                addr: listen.clone(),
                source,
            })?;

        let config = Config {
            listen,
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms.unwrap_or(file.server.poll_timeout_ms),
            ),
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            events: cli.events.unwrap_or(file.server.events),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if config.events == 0 {
            return Err(ConfigError::Invalid("events must be at least 1"));
        }
        if config.events > MAX_EVENTS {
            return Err(ConfigError::Invalid("events must be at most 65536"));
        }
        if config.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms must be at least 1"));
        }
        if config.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1"));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{addr}': {source}")]
    InvalidListen {
        addr: String,
        source: AddrParseError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
