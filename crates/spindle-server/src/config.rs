//! Configuration for the socket server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use spindle_core::ConnectionConfig;
use std::path::PathBuf;

/// Default socket path for the server.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/spindle.sock";

/// Configuration for the spindle server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the Unix socket to listen on.
    pub socket_path: PathBuf,

    /// Settings for the shared connection.
    pub connection: ConnectionConfig,

    /// Open the engine before accepting clients (default: false).
    pub auto_open: bool,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error(transparent)]
    Connection(#[from] spindle_core::ConfigError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connection: ConnectionConfig::default(),
            auto_open: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SPINDLE_SOCKET` | `/tmp/spindle.sock` |
    /// | `SPINDLE_MAX_SOURCE_BYTES` | `65536` |
    /// | `SPINDLE_MEMORY_LIMIT` | unlimited |
    /// | `SPINDLE_INSTRUCTION_LIMIT` | unlimited |
    /// | `SPINDLE_NOTIFY_ABANDONED` | `false` |
    /// | `SPINDLE_AUTO_OPEN` | `false` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default = Self::default();
        let mut connection = default.connection;

        if let Some(bytes) = parse(&lookup, "SPINDLE_MAX_SOURCE_BYTES")? {
            connection.max_source_bytes = bytes;
        }
        connection.memory_limit = parse(&lookup, "SPINDLE_MEMORY_LIMIT")?;
        connection.instruction_limit = parse(&lookup, "SPINDLE_INSTRUCTION_LIMIT")?;
        connection.notify_abandoned = flag(&lookup, "SPINDLE_NOTIFY_ABANDONED", false);
        connection.validate()?;

        Ok(Self {
            socket_path: lookup("SPINDLE_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.socket_path),
            connection,
            auto_open: flag(&lookup, "SPINDLE_AUTO_OPEN", default.auto_open),
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: bool) -> bool {
    lookup(var)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}
