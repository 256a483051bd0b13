//! Configuration module for tally.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments shared by both processes
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author = "tally authors")]
#[command(version = "0.1.0")]
#[command(about = "A shared network counter with an HTTP bridge", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

/// Which process to run
#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Run the line protocol counter server
    Server(ServerArgs),
    /// Run the HTTP bridge in front of a counter server
    Bridge(BridgeArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Port to listen on (default 12345)
    pub port: Option<u16>,

    /// Address to bind to (default 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of concurrent client connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Per-connection line buffer capacity in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct BridgeArgs {
    /// Counter server host (default 127.0.0.1)
    pub upstream_host: Option<String>,

    /// Counter server port (default 12345)
    pub upstream_port: Option<u16>,

    /// Local HTTP port (default 8000)
    pub http_port: Option<u16>,

    /// Address the HTTP listener binds to (default 127.0.0.1)
    #[arg(long)]
    pub listen_host: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Connection table capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-connection line buffer capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum readiness events handled per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Counter server host
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    /// Counter server port
    #[serde(default = "default_server_port")]
    pub upstream_port: u16,
    /// Address the HTTP listener binds to
    #[serde(default = "default_bridge_host")]
    pub listen_host: String,
    /// Port the HTTP listener binds to
    #[serde(default = "default_http_port")]
    pub listen_port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            upstream_host: default_upstream_host(),
            upstream_port: default_server_port(),
            listen_host: default_bridge_host(),
            listen_port: default_http_port(),
        }
    }
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
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

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    12345
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    4096
}

fn default_events_capacity() -> usize {
    1024
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which process this invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Bridge,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
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

    /// Merge CLI args over TOML values (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut server = toml_config.server;
        let mut bridge = toml_config.bridge;

        let mode = match cli.mode {
            ModeArgs::Server(args) => {
                server.port = args.port.unwrap_or(server.port);
                server.host = args.host.unwrap_or(server.host);
                server.max_connections = args.max_connections.unwrap_or(server.max_connections);
                server.buffer_size = args.buffer_size.unwrap_or(server.buffer_size);
                Mode::Server
            }
            ModeArgs::Bridge(args) => {
                bridge.upstream_host = args.upstream_host.unwrap_or(bridge.upstream_host);
                bridge.upstream_port = args.upstream_port.unwrap_or(bridge.upstream_port);
                bridge.listen_port = args.http_port.unwrap_or(bridge.listen_port);
                bridge.listen_host = args.listen_host.unwrap_or(bridge.listen_host);
                Mode::Bridge
            }
        };

        if server.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if server.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1"));
        }
        if server.events_capacity == 0 {
            return Err(ConfigError::Invalid("events_capacity must be at least 1"));
        }

        Ok(Config {
            mode,
            server,
            bridge,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.bridge.upstream_host, "127.0.0.1");
        assert_eq!(config.bridge.upstream_port, 12345);
        assert_eq!(config.bridge.listen_port, 8000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 4000
            max_connections = 8

            [bridge]
            upstream_host = "counter.local"
            listen_port = 9000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.bridge.upstream_host, "counter.local");
        assert_eq!(config.bridge.upstream_port, 12345);
        assert_eq!(config.bridge.listen_port, 9000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_positional_port() {
        let config = Config::merge(cli(&["tally", "server", "7000"]), TomlConfig::default()).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.listen_addr(), "0.0.0.0:7000");
    }

    #[test]
    fn test_bridge_positional_args() {
        let config = Config::merge(
            cli(&["tally", "bridge", "10.0.0.5", "4000", "8080"]),
            TomlConfig::default(),
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Bridge);
        assert_eq!(config.bridge.upstream_host, "10.0.0.5");
        assert_eq!(config.bridge.upstream_port, 4000);
        assert_eq!(config.bridge.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_bridge_defaults_without_args() {
        let config = Config::merge(cli(&["tally", "bridge"]), TomlConfig::default()).unwrap();
        assert_eq!(config.bridge.upstream_host, "127.0.0.1");
        assert_eq!(config.bridge.upstream_port, 12345);
        assert_eq!(config.bridge.listen_port, 8000);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 4000
            max_connections = 8

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["tally", "--log-level", "trace", "server", "5000"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_explicit_default_log_level_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["tally", "--log-level", "info", "server"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.log_level, "info");

        let config = Config::merge(cli(&["tally", "server"]), TomlConfig::default()).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Config::merge(
            cli(&["tally", "server", "--max-connections", "0"]),
            TomlConfig::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(CliArgs::try_parse_from(["tally", "server", "70000"]).is_err());
    }
}
