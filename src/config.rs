//! Configuration module for the echo server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in defaults. With no arguments at all both
//! binaries run the fixed loopback harness configuration.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Close code sent on deliberate connection shutdown.
pub const CLOSE_CODE: u32 = 0x0B;

/// Error code used when a stream is torn down abnormally.
pub const STREAM_ERROR_CODE: u32 = 0x0A;

/// ALPN protocol negotiated by both sides.
pub const ALPN_PROTOCOL: &[u8] = b"h3";

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "quic-echo-server")]
#[command(version = "0.1.0")]
#[command(about = "QUIC echo server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:23456)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the load-generating client
#[derive(Parser, Debug, Default)]
#[command(name = "quic-echo-client")]
#[command(version = "0.1.0")]
#[command(about = "QUIC echo client harness", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address to connect to (e.g., 127.0.0.1:23456)
    #[arg(short = 'r', long)]
    pub remote: Option<String>,

    /// Number of concurrent sessions to spawn
    #[arg(short = 'n', long)]
    pub sessions: Option<usize>,

    /// Seed for disconnect decisions (random when unset)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Idle timeout advertised to peers, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Per-connection receive buffer size
    #[serde(default = "default_server_buffer_size")]
    pub buffer_size: usize,
    /// UDP socket receive buffer size in bytes (OS default when unset)
    pub recv_buffer_size: Option<usize>,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout_secs: default_idle_timeout(),
            buffer_size: default_server_buffer_size(),
            recv_buffer_size: None,
            workers: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server address
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Server name presented in the TLS handshake
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Number of sessions to spawn
    #[serde(default = "default_sessions")]
    pub sessions: usize,
    /// Delay between session launches in milliseconds
    #[serde(default = "default_spawn_interval")]
    pub spawn_interval_ms: u64,
    /// Delay between messages within a session in milliseconds
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,
    /// Delay before the first session is launched in milliseconds
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
    /// Each iteration disconnects with probability 1 / disconnect_one_in
    #[serde(default = "default_disconnect_one_in")]
    pub disconnect_one_in: u32,
    /// Per-session receive buffer size
    #[serde(default = "default_client_buffer_size")]
    pub buffer_size: usize,
    /// Seed for disconnect decisions
    pub seed: Option<u64>,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            server_name: default_server_name(),
            sessions: default_sessions(),
            spawn_interval_ms: default_spawn_interval(),
            send_interval_ms: default_send_interval(),
            startup_delay_ms: default_startup_delay(),
            disconnect_one_in: default_disconnect_one_in(),
            buffer_size: default_client_buffer_size(),
            seed: None,
            workers: None,
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
    "0.0.0.0:23456".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_server_buffer_size() -> usize {
    4096
}

fn default_remote() -> String {
    "127.0.0.1:23456".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_sessions() -> usize {
    1000
}

fn default_spawn_interval() -> u64 {
    5
}

fn default_send_interval() -> u64 {
    10
}

fn default_startup_delay() -> u64 {
    1000
}

fn default_disconnect_one_in() -> u32 {
    10
}

fn default_client_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub recv_buffer_size: Option<usize>,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ServerArgs::default(), TomlConfig::default())
    }
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ServerArgs::parse();
        let toml_config = read_toml(cli.config.as_deref())?;
        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn resolve(cli: ServerArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        ServerConfig {
            listen: cli.listen.unwrap_or(server.listen),
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            buffer_size: server.buffer_size,
            recv_buffer_size: server.recv_buffer_size,
            workers: cli.workers.or(server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub remote: String,
    pub server_name: String,
    pub sessions: usize,
    pub spawn_interval: Duration,
    pub send_interval: Duration,
    pub startup_delay: Duration,
    pub disconnect_one_in: u32,
    pub buffer_size: usize,
    pub seed: Option<u64>,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::resolve(ClientArgs::default(), TomlConfig::default())
    }
}

impl ClientConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ClientArgs::parse();
        let toml_config = read_toml(cli.config.as_deref())?;
        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn resolve(cli: ClientArgs, toml_config: TomlConfig) -> Self {
        let client = toml_config.client;
        ClientConfig {
            remote: cli.remote.unwrap_or(client.remote),
            server_name: client.server_name,
            sessions: cli.sessions.unwrap_or(client.sessions),
            spawn_interval: Duration::from_millis(client.spawn_interval_ms),
            send_interval: Duration::from_millis(client.send_interval_ms),
            startup_delay: Duration::from_millis(client.startup_delay_ms),
            disconnect_one_in: client.disconnect_one_in,
            buffer_size: client.buffer_size,
            seed: cli.seed.or(client.seed),
            workers: cli.workers.or(client.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
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

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:23456");
        assert_eq!(config.server.idle_timeout_secs, 60);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.client.remote, "127.0.0.1:23456");
        assert_eq!(config.client.sessions, 1000);
        assert_eq!(config.client.disconnect_one_in, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:4433"
            idle_timeout_secs = 30
            recv_buffer_size = 4194304
            workers = 4

            [client]
            remote = "127.0.0.1:4433"
            sessions = 10
            spawn_interval_ms = 1
            seed = 7

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:4433");
        assert_eq!(config.server.idle_timeout_secs, 30);
        assert_eq!(config.server.recv_buffer_size, Some(4194304));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.client.sessions, 10);
        assert_eq!(config.client.spawn_interval_ms, 1);
        assert_eq!(config.client.send_interval_ms, 10);
        assert_eq!(config.client.seed, Some(7));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [client]
            remote = "10.0.0.1:1"
            sessions = 5
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let cli = ClientArgs {
            sessions: Some(3),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = ClientConfig::resolve(cli, toml_config);
        assert_eq!(config.remote, "10.0.0.1:1");
        assert_eq!(config.sessions, 3);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.spawn_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_fixed_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.listen, "0.0.0.0:23456");
        assert_eq!(server.idle_timeout, Duration::from_secs(60));

        let client = ClientConfig::default();
        assert_eq!(client.startup_delay, Duration::from_secs(1));
        assert_eq!(client.send_interval, Duration::from_millis(10));
        assert_eq!(client.buffer_size, 1024);
        assert!(client.seed.is_none());
    }

    #[test]
    fn test_missing_file_error() {
        let err = read_toml(Some(Path::new("/nonexistent/quic-echo.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("/nonexistent/quic-echo.toml"));
    }
}
