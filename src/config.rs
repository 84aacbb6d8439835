//! Configuration module for the query counter server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Configuration is
//! resolved once at startup and passed by value into each component.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default UDP port of the server, also the client's default service
pub const DEFAULT_PORT: u16 = 12345;

/// Server runtime backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Async receive loop on tokio
    #[default]
    Tokio,
    /// Readiness-based event loop on mio (epoll/kqueue)
    Mio,
}

/// Command-line arguments for the counter server
#[derive(Parser, Debug, Default)]
#[command(name = "query-counter-server")]
#[command(version)]
#[command(about = "Counts GET requests received over UDP and persists the count", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (default: "::", all interfaces, IPv4 and IPv6)
    #[arg(long)]
    pub host: Option<String>,

    /// UDP port on which to listen (default: 12345)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding the persistent storage file (default: current directory)
    #[arg(short = 'd', long)]
    pub work_directory: Option<PathBuf>,

    /// Sync the storage file to disk after every increment
    #[arg(long)]
    pub fsync: bool,

    /// Runtime backend
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error, fatal, or -2 to 3)
    #[arg(long, allow_hyphen_values = true)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the polling client
#[derive(Parser, Debug, Default)]
#[command(name = "query-counter-client")]
#[command(version)]
#[command(about = "Polls a query counter server and logs the count", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Name or address of the target server (default: localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// UDP port or service name on the target server (default: 12345)
    #[arg(short, long)]
    pub service: Option<String>,

    /// Seconds between two polls (default: 5)
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error, fatal, or -2 to 3)
    #[arg(long, allow_hyphen_values = true)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub client: ClientSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Runtime backend
    #[serde(default)]
    pub runtime: RuntimeType,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime: RuntimeType::default(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Directory holding the counter file
    #[serde(default = "default_work_directory")]
    pub work_directory: PathBuf,
    /// Sync file data after every write
    #[serde(default)]
    pub fsync: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            work_directory: default_work_directory(),
            fsync: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
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

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Target server name or address
    #[serde(default = "default_target_host")]
    pub host: String,
    /// Target port or service name
    #[serde(default = "default_service")]
    pub service: String,
    /// Seconds between polls
    #[serde(default = "default_interval")]
    pub interval: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_target_host(),
            service: default_service(),
            interval: default_interval(),
        }
    }
}

fn default_host() -> String {
    "::".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_work_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_target_host() -> String {
    "localhost".to_string()
}

fn default_service() -> String {
    DEFAULT_PORT.to_string()
}

fn default_interval() -> u64 {
    5
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub work_directory: PathBuf,
    pub fsync: bool,
    pub runtime: RuntimeType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge CLI args with the TOML file they point to (CLI takes precedence)
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = read_toml(cli.config.as_deref())?;

        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            work_directory: cli
                .work_directory
                .unwrap_or(toml_config.storage.work_directory),
            fsync: cli.fsync || toml_config.storage.fsync,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            log_level: normalize_log_level(&log_level)?,
        })
    }

    /// Resolve the address to bind to
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_first(&self.host, self.port)
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub service: String,
    pub interval: Duration,
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(ClientArgs::parse())
    }

    /// Merge CLI args with the TOML file they point to (CLI takes precedence)
    pub fn resolve(cli: ClientArgs) -> Result<Self, ConfigError> {
        let toml_config = read_toml(cli.config.as_deref())?;

        let interval = cli.interval.unwrap_or(toml_config.client.interval);
        if interval == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);

        Ok(ClientConfig {
            host: cli.host.unwrap_or(toml_config.client.host),
            service: cli.service.unwrap_or(toml_config.client.service),
            interval: Duration::from_secs(interval),
            log_level: normalize_log_level(&log_level)?,
        })
    }
}

fn read_toml(path: Option<&Path>) -> Result<TomlConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

/// Resolve `host:port` to the first matching socket address
pub fn resolve_first(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::InvalidAddress(format!("{host}:{port}"), e.to_string()))?
        .next()
        .ok_or_else(|| {
            ConfigError::InvalidAddress(format!("{host}:{port}"), "no address found".to_string())
        })
}

/// Map a configured level to a tracing filter directive.
///
/// Accepts level names and the numeric scale -2 (trace) to 3 (fatal).
/// `fatal` has no tracing counterpart and maps to `error`.
pub fn normalize_log_level(level: &str) -> Result<String, ConfigError> {
    let normalized = match level.trim().to_ascii_lowercase().as_str() {
        "trace" | "-2" => "trace",
        "debug" | "-1" => "debug",
        "info" | "0" => "info",
        "warn" | "warning" | "1" => "warn",
        "error" | "2" | "fatal" | "3" => "error",
        _ => return Err(ConfigError::InvalidLogLevel(level.to_string())),
    };
    Ok(normalized.to_string())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid log level '{0}'")]
    InvalidLogLevel(String),

    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, String),

    #[error("Poll interval must be at least one second")]
    InvalidInterval,
}
