//! Error types for spindle-core.

use crate::engine::EngineState;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for spindle-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Any error surfaced by spindle-core.
#[derive(Debug, Error)]
pub enum Error {
    /// A command was rejected at submission.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// A connection could not be started.
    #[error(transparent)]
    Start(#[from] StartError),

    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The queue refuses items once it has been sealed or drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Synchronous rejection of a command, returned before anything is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Teardown has begun; the connection accepts no more commands.
    #[error("queue closed")]
    QueueClosed,

    /// The requester's mailbox can no longer receive replies.
    #[error("requester mailbox is closed")]
    InvalidRequester,

    /// Source contains a character outside the single-byte range.
    #[error("source is not single-byte text: {ch:?} at char {position}")]
    InvalidInput {
        /// Offending character.
        ch: char,
        /// Char index of the offending character.
        position: usize,
    },

    /// An eval was submitted without source text.
    #[error("missing source for eval")]
    MissingSource,

    /// Source does not fit the staging budget.
    #[error("source is {len} bytes, limit is {limit}")]
    InputTooLarge {
        /// Encoded length of the source.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl From<QueueClosed> for SubmitError {
    fn from(_: QueueClosed) -> Self {
        Self::QueueClosed
    }
}

/// Failure to bring up a connection. No engine exists when this is returned.
#[derive(Debug, Error)]
pub enum StartError {
    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The connection configuration did not validate.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The process-wide runtime has been shut down.
    #[error("runtime has been shut down")]
    RuntimeShutDown,
}

/// Engine-level failure, delivered asynchronously inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// The execution context could not be created.
    #[error("context open failed: {0}")]
    ContextOpenFailed(String),

    /// Eval was issued while the engine was not open.
    #[error("engine is not open (state: {state})")]
    NotOpen {
        /// State the engine was in.
        state: EngineState,
    },

    /// The command kind was not recognized.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The backend panicked while handling a command.
    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_source_bytes must be > 0")]
    ZeroSourceLimit,

    #[error("memory_limit must be > 0 when set")]
    ZeroMemoryLimit,

    #[error("instruction_limit must be > 0 when set")]
    ZeroInstructionLimit,

    #[error("thread_name must be non-empty and contain no NUL bytes")]
    InvalidThreadName,

    #[error("stack_size must be > 0 when set")]
    ZeroStackSize,
}
