//! Configuration for the chat server and client binaries
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::connection::DEFAULT_MAX_LINE_LENGTH;
use crate::error::AppError;

/// Default host for both listening and connecting
pub const DEFAULT_HOST: &str = "localhost";
/// Default chat port
pub const DEFAULT_PORT: u16 = 8024;
/// Default limit on concurrently registered connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
/// Directory refresh interval used by the client binary
pub const DEFAULT_REFRESH_SECS: u64 = 10;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "line_chat")]
#[command(version)]
#[command(about = "A multi-client line-based TCP chat server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to listen on (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(short, long)]
    pub max_connections: Option<usize>,

    /// Maximum length of a single line in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the chat client
#[derive(Parser, Debug)]
#[command(name = "line_chat_client")]
#[command(version)]
#[command(about = "Interactive client for the line-based chat server", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host to connect to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Server port to connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Nickname announced after connecting
    #[arg(short, long)]
    pub nickname: Option<String>,

    /// Seconds between automatic directory refreshes (0 disables, default 10)
    #[arg(long)]
    pub refresh_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub nickname: Option<String>,
    pub directory_refresh_secs: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            nickname: None,
            directory_refresh_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read the TOML file at `path`, or return defaults when no path is given
pub fn load_toml(path: Option<&Path>) -> Result<TomlConfig, AppError> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| AppError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_line_length: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process arguments and optional TOML file
    pub fn load() -> Result<Self, AppError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(cli: ServerArgs) -> Result<Self, AppError> {
        let toml_config = load_toml(cli.config.as_deref())?;
        let server = toml_config.server;

        let config = ServerConfig {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_line_length: cli.max_line_length.unwrap_or(server.max_line_length),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        if config.max_line_length == 0 {
            return Err(AppError::Config(
                "max_line_length must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub nickname: String,
    /// Send a directory request on this interval while connected
    pub directory_refresh: Option<Duration>,
    pub max_line_length: usize,
    pub log_level: String,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, nickname: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            nickname: nickname.into(),
            directory_refresh: None,
            max_line_length: default_max_line_length(),
            log_level: default_log_level(),
        }
    }

    pub fn with_directory_refresh(mut self, interval: Duration) -> Self {
        self.directory_refresh = Some(interval);
        self
    }

    /// `host:port` as used for connecting and in notices
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Merge CLI arguments over the TOML file. The nickname is required.
    pub fn from_args(cli: ClientArgs) -> Result<Self, AppError> {
        let toml_config = load_toml(cli.config.as_deref())?;
        let client = toml_config.client;

        let nickname = cli
            .nickname
            .or(client.nickname)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AppError::Config(
                    "a nickname is required (--nickname or [client] nickname)".to_string(),
                )
            })?;

        let refresh_secs = cli
            .refresh_secs
            .or(client.directory_refresh_secs)
            .unwrap_or(DEFAULT_REFRESH_SECS);

        Ok(ClientConfig {
            host: cli.host.unwrap_or(client.host),
            port: cli.port.unwrap_or(client.port),
            nickname,
            directory_refresh: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            max_line_length: default_max_line_length(),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}
