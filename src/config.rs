//! Configuration module for the mux-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "mux-echo")]
#[command(author = "mux-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded readiness-based TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind to (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog depth
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrent connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum readiness events returned by a single wait
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Wait timeout in milliseconds (omit to block until readiness)
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

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
    pub event_loop: EventLoopConfig,
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
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Set SO_REUSEADDR on the listening socket
    #[serde(default = "default_reuse_address")]
    pub reuse_address: bool,
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            reuse_address: default_reuse_address(),
            max_connections: 0,
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct EventLoopConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Absent means block until something is ready
    pub wait_timeout_ms: Option<u64>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            wait_timeout_ms: None,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> u32 {
    1000
}

fn default_reuse_address() -> bool {
    true
}

fn default_max_events() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub reuse_address: bool,
    pub max_connections: usize,
    pub max_events: usize,
    pub wait_timeout: Option<Duration>,
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

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            reuse_address: toml_config.server.reuse_address,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_events: cli.max_events.unwrap_or(toml_config.event_loop.max_events),
            wait_timeout: cli
                .wait_timeout_ms
                .or(toml_config.event_loop.wait_timeout_ms)
                .map(Duration::from_millis),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 || i32::try_from(self.backlog).is_err() {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: format!("{} is not a positive 32-bit value", self.backlog),
            });
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid {
                field: "max_events",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid { field: &'static str, reason: String },
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
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid value for '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
