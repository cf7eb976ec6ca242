//! Configuration for the relay server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay server
#[derive(Parser, Debug, Default)]
#[command(name = "fanout-server")]
#[command(version)]
#[command(about = "TCP broadcast relay server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to; resolved to its first IPv4 address
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of simultaneous connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Size of each I/O buffer segment in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the relay client
#[derive(Parser, Debug, Default)]
#[command(name = "fanout-client")]
#[command(version)]
#[command(about = "Interactive client for the TCP broadcast relay", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address as a literal IPv4 socket address (e.g., 127.0.0.1:8001)
    #[arg(short = 'a', long)]
    pub connect: Option<String>,

    /// Number of connections the context pool is sized for
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Size of each I/O buffer segment in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

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
    #[serde(default = "default_server_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle timeout in seconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_server_max_connections(),
            buffer_size: default_buffer_size(),
            idle_timeout: 0,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_connect")]
    pub connect: String,
    #[serde(default = "default_client_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            max_connections: default_client_max_connections(),
            buffer_size: default_buffer_size(),
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
    "localhost".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_server_max_connections() -> usize {
    5
}

fn default_client_max_connections() -> usize {
    2
}

fn default_buffer_size() -> usize {
    2048
}

fn default_connect() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ServerArgs::parse();
        let toml_config = load_toml(cli.config.as_deref())?;
        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: ServerArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let section = toml_config.server;
        let idle_secs = cli.idle_timeout.unwrap_or(section.idle_timeout);

        let config = ServerConfig {
            host: cli.host.unwrap_or(section.host),
            port: cli.port.unwrap_or(section.port),
            max_connections: cli.max_connections.unwrap_or(section.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(section.buffer_size),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        validate_sizes(config.max_connections, config.buffer_size)?;
        Ok(config)
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect: SocketAddrV4,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ClientArgs::parse();
        let toml_config = load_toml(cli.config.as_deref())?;
        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: ClientArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let section = toml_config.client;
        let connect = cli.connect.unwrap_or(section.connect);
        let connect = connect
            .parse::<SocketAddrV4>()
            .map_err(|_| ConfigError::Invalid(format!("'{connect}' is not an IPv4 address and port")))?;

        let config = ClientConfig {
            connect,
            max_connections: cli.max_connections.unwrap_or(section.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(section.buffer_size),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        validate_sizes(config.max_connections, config.buffer_size)?;
        Ok(config)
    }
}

fn load_toml(path: Option<&Path>) -> Result<TomlConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

fn validate_sizes(max_connections: usize, buffer_size: usize) -> Result<(), ConfigError> {
    if max_connections == 0 {
        return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
    }
    if buffer_size == 0 {
        return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.server.max_connections, 5);
        assert_eq!(config.server.buffer_size, 2048);
        assert_eq!(config.client.connect, "127.0.0.1:8001");
        assert_eq!(config.client.max_connections, 2);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            max_connections = 64
            idle_timeout = 30

            [client]
            connect = "10.0.0.1:9000"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.buffer_size, 2048);
        assert_eq!(config.server.idle_timeout, 30);
        assert_eq!(config.client.connect, "10.0.0.1:9000");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 9000\nidle_timeout = 5").unwrap();
        let cli = ServerArgs {
            port: Some(7000),
            max_connections: Some(2),
            ..Default::default()
        };

        let config = ServerConfig::merge(cli, toml_config).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = ServerConfig::merge(ServerArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let cli = ServerArgs {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_client_requires_literal_ipv4() {
        let cli = ClientArgs {
            connect: Some("localhost:8001".into()),
            ..Default::default()
        };
        assert!(matches!(
            ClientConfig::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let config = ClientConfig::merge(ClientArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.connect, "127.0.0.1:8001".parse().unwrap());
        assert_eq!(config.max_connections, 2);
    }
}
