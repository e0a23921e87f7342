//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Readiness multiplexer used by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Linux epoll (scalable).
    Epoll,
    /// select(2) over fixed-size descriptor sets (legacy).
    Select,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            BackendType::Epoll
        } else {
            BackendType::Select
        }
    }
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-reactor")]
#[command(version = "0.1.0")]
#[command(about = "A non-blocking single-threaded TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Readiness backend
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendType>,

    /// Poll timeout in milliseconds (how often the running flag is re-checked)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Bytes read per readiness notification
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Greeting sent on accept (empty disables it)
    #[arg(long)]
    pub greeting: Option<String>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: BackendType,
    /// listen(2) backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: BackendType::default(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Maximum events returned by one poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            read_chunk_size: default_read_chunk_size(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Echo behaviour
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_backlog() -> i32 {
    128
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    64
}

fn default_greeting() -> String {
    "Welcome to Echo Server! Send any message and I'll echo it back.\n".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: BackendType,
    pub backlog: i32,
    pub max_connections: usize,
    pub poll_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub events_capacity: usize,
    pub greeting: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            poll_timeout_ms: cli
                .poll_timeout_ms
                .unwrap_or(toml_config.runtime.poll_timeout_ms),
            read_chunk_size: cli
                .read_chunk_size
                .unwrap_or(toml_config.runtime.read_chunk_size),
            events_capacity: toml_config.runtime.events_capacity,
            greeting: cli.greeting.unwrap_or(toml_config.echo.greeting),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the event loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ConfigError::InvalidValue("read_chunk_size must be > 0"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::InvalidValue("events_capacity must be > 0"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("poll_timeout_ms must be > 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0"));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            backend: None,
            poll_timeout_ms: None,
            read_chunk_size: None,
            max_connections: None,
            greeting: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidValue(&'static str),
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
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
