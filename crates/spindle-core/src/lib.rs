//! # spindle-core
//!
//! Serialized access to a single-threaded script engine from many concurrent
//! callers.
//!
//! An embedded interpreter is not thread-safe, but the callers that want to
//! use it live on many threads and tasks. A [`Connection`] owns one dedicated
//! worker thread, and that thread owns the interpreter. Callers push commands
//! onto a blocking queue and return immediately; the worker runs them one at a
//! time, in order, and posts each result to the caller's mailbox.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ caller A   │ │ caller B   │ │ caller C   │   any thread / task
//! └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!       │ open/eval/close (non-blocking)│
//!       ▼              ▼              ▼
//! ┌──────────────────────────────────────────┐
//! │ Connection                               │
//! │   BlockingQueue<Command>  (FIFO, seal)   │
//! └────────────────────┬─────────────────────┘
//!                      │ pop (blocks)
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │ Worker thread                            │
//! │   EngineHandle<B: ScriptBackend>         │
//! │   Uninitialized ─▶ Open ─▶ Closed        │
//! └────────────────────┬─────────────────────┘
//!                      │ Reply { id, outcome }
//!                      ▼
//!            requester's Mailbox (A, B or C)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use spindle_core::{mailbox, ConnectionConfig, CorrelationId};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runtime = spindle_core::init();
//! let conn = runtime.start(ConnectionConfig::default())?;
//! let (requester, mut replies) = mailbox();
//!
//! conn.open(CorrelationId::from(1), requester.clone())?;
//! conn.eval(CorrelationId::from(2), requester, "2 + 2")?;
//!
//! while let Some(reply) = replies.recv().await {
//!     println!("{} -> {}", reply.id, reply.status());
//! }
//!
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **Exclusive engine access**: only the worker thread ever touches the engine
//! - **Per-connection ordering**: commands run, and replies arrive, in submission order
//! - **Non-blocking submission**: callers never wait on the engine
//! - **Clean teardown**: commands still queued at teardown never run

mod command;
mod config;
mod connection;
pub mod engine;
mod error;
mod mailbox;
mod queue;
mod runtime;
mod value;
mod worker;

pub use command::{Command, CommandKind, CorrelationId, Source};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, DEFAULT_MAX_SOURCE_BYTES, DEFAULT_THREAD_NAME};
pub use connection::{Connection, ConnectionId, ConnectionStats, StatsSnapshot, TeardownReport};
pub use engine::lua::LuaBackend;
pub use engine::{EngineHandle, EngineState, ScriptBackend};
pub use error::{ConfigError, EngineError, Error, QueueClosed, Result, StartError, SubmitError};
pub use mailbox::{mailbox, Mailbox, Outcome, Reply, ReplyStatus, Requester};
pub use queue::BlockingQueue;
pub use runtime::{init, Runtime};
pub use value::{decode_latin1, encode_latin1, TaggedValue};
pub use worker::{WorkerReport, WorkerState};
