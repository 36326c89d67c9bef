//! Configuration for the engine and the server binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "completion-server")]
#[command(author = "completion-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A completion-driven TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to CPU cores x workers-per-core)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of accepts kept outstanding on the listener
    #[arg(short = 'a', long)]
    pub accept_depth: Option<usize>,

    /// Size of each pooled operation buffer in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit worker thread count; overrides `workers_per_core`
    pub workers: Option<usize>,
    #[serde(default = "default_workers_per_core")]
    pub workers_per_core: usize,
    /// Accepts kept outstanding on the listener
    #[serde(default = "default_accept_depth")]
    pub accept_depth: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Readiness events handled per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            workers_per_core: default_workers_per_core(),
            accept_depth: default_accept_depth(),
            max_connections: default_max_connections(),
            listen_backlog: default_listen_backlog(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Operation pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Bytes per operation buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Operations created up front
    #[serde(default = "default_initial_operations")]
    pub initial_operations: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            initial_operations: default_initial_operations(),
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
    10240
}

fn default_workers_per_core() -> usize {
    1
}

fn default_accept_depth() -> usize {
    2
}

fn default_max_connections() -> usize {
    10_000
}

fn default_listen_backlog() -> i32 {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    4 * 1024 // 4 KB
}

fn default_initial_operations() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub workers_per_core: usize,
    pub accept_depth: usize,
    pub max_connections: usize,
    pub listen_backlog: i32,
    pub events_capacity: usize,
    pub buffer_size: usize,
    pub initial_operations: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_values(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            workers: cli.workers.or(server.workers),
            workers_per_core: server.workers_per_core,
            accept_depth: cli.accept_depth.unwrap_or(server.accept_depth),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            listen_backlog: server.listen_backlog,
            events_capacity: server.events_capacity,
            buffer_size: cli.buffer_size.unwrap_or(toml_config.pool.buffer_size),
            initial_operations: toml_config.pool.initial_operations,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Number of worker threads to spawn.
    pub fn worker_threads(&self) -> usize {
        match self.workers {
            Some(n) if n > 0 => n,
            _ => (num_cpus() * self.workers_per_core).max(1),
        }
    }
}

impl CliArgs {
    fn default_values() -> Self {
        Self {
            config: None,
            host: None,
            port: None,
            workers: None,
            accept_depth: None,
            buffer_size: None,
            max_connections: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 10240);
        assert_eq!(config.accept_depth, 2);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.initial_operations, 3);
        assert_eq!(config.workers_per_core, 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            workers = 4
            accept_depth = 8

            [pool]
            buffer_size = 8192
            initial_operations = 16

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.accept_depth, 8);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.pool.buffer_size, 8192);
        assert_eq!(config.pool.initial_operations, 16);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            accept_depth = 8
        "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from(["completion-server", "--port", "7000", "-w", "3"]);

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert_eq!(config.accept_depth, 8);
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.worker_threads(), 3);
    }

    #[test]
    fn test_worker_threads_scale_with_cores() {
        let config = Config {
            workers: None,
            workers_per_core: 2,
            ..Config::default()
        };
        assert_eq!(config.worker_threads(), num_cpus() * 2);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["completion-server", "-c", "/nonexistent/server.toml"]);
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
