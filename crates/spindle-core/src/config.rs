//! Connection configuration types.

use crate::error::ConfigError;

/// Default staging budget for eval source, in encoded bytes (64 KiB).
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Default name given to worker threads.
pub const DEFAULT_THREAD_NAME: &str = "spindle-worker";

/// Configuration for starting a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest eval source accepted, in single-byte-encoded bytes (default: 64 KiB).
    pub max_source_bytes: usize,
    /// Heap limit for the interpreter, in bytes (default: unlimited).
    pub memory_limit: Option<usize>,
    /// Instruction budget for a single eval (default: unlimited).
    pub instruction_limit: Option<u32>,
    /// Send a `Cancelled` reply to commands abandoned at teardown (default: false,
    /// abandoned commands get no reply at all).
    pub notify_abandoned: bool,
    /// Name of the worker thread (default: `spindle-worker`).
    pub thread_name: String,
    /// Worker thread stack size in bytes (default: platform default).
    pub stack_size: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            memory_limit: None,
            instruction_limit: None,
            notify_abandoned: false,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a new config builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_source_bytes == 0 {
            return Err(ConfigError::ZeroSourceLimit);
        }
        if self.memory_limit == Some(0) {
            return Err(ConfigError::ZeroMemoryLimit);
        }
        if self.instruction_limit == Some(0) {
            return Err(ConfigError::ZeroInstructionLimit);
        }
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(ConfigError::InvalidThreadName);
        }
        if self.stack_size == Some(0) {
            return Err(ConfigError::ZeroStackSize);
        }
        Ok(())
    }
}

/// Builder for ConnectionConfig.
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Set the eval source budget in bytes.
    pub fn max_source_bytes(mut self, bytes: usize) -> Self {
        self.config.max_source_bytes = bytes;
        self
    }

    /// Set the interpreter heap limit in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    /// Set the per-eval instruction budget.
    pub fn instruction_limit(mut self, instructions: u32) -> Self {
        self.config.instruction_limit = Some(instructions);
        self
    }

    /// Reply `Cancelled` to commands abandoned at teardown.
    pub fn notify_abandoned(mut self, notify: bool) -> Self {
        self.config.notify_abandoned = notify;
        self
    }

    /// Set the worker thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the worker thread stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
