//! Connection: the externally visible handle to one worker and its engine.
//!
//! A `Connection` is cheap to clone and safe to share across threads and
//! tasks; every clone addresses the same worker. Submissions return as soon as
//! the command is queued. The outcome arrives later in the requester's mailbox.
//!
//! # Teardown
//!
//! [`teardown`](Connection::teardown), or dropping the last handle:
//! 1. Seals the queue with `Shutdown` so no further command is accepted
//! 2. Joins the worker thread, which closes the engine on its way out
//! 3. Discards the commands that were still queued. They never run. By default
//!    they get no reply at all; with `notify_abandoned` they get `Cancelled`
//!
//! When the last handle is dropped on the worker thread itself, step 2 is
//! skipped: the worker finishes the command in hand, pops `Shutdown` and
//! performs step 3 before its thread ends.

use crate::command::{Command, CorrelationId, Request, Source};
use crate::config::ConnectionConfig;
use crate::engine::lua::LuaBackend;
use crate::engine::ScriptBackend;
use crate::error::{StartError, SubmitError};
use crate::mailbox::Requester;
use crate::queue::BlockingQueue;
use crate::worker::{self, StateCell, WorkerReport, WorkerState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Connection counters.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands accepted into the queue.
    pub submitted: AtomicU64,
    /// Submissions refused synchronously.
    pub rejected: AtomicU64,
    /// Commands that ran and replied with an ok status.
    pub completed: AtomicU64,
    /// Commands that ran and replied with an error status.
    pub failed: AtomicU64,
    /// Commands drained unexecuted at teardown.
    pub abandoned: AtomicU64,
}

impl ConnectionStats {
    /// Commands accepted into the queue so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Submissions refused so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Commands that replied with an ok status.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Commands that replied with an error status.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Commands discarded unexecuted at teardown.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted(),
            rejected: self.rejected(),
            completed: self.completed(),
            failed: self.failed(),
            abandoned: self.abandoned(),
        }
    }
}

/// Plain copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
}

/// What a call to [`Connection::teardown`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    /// False if an earlier call had already torn the connection down.
    pub performed: bool,
    /// Commands the worker dispatched over its lifetime.
    pub processed: u64,
    /// Commands drained unexecuted.
    pub abandoned: usize,
}

// ============================================================================
// Connection
// ============================================================================

pub(crate) struct Shared {
    id: ConnectionId,
    config: ConnectionConfig,
    queue: Arc<BlockingQueue<Command>>,
    worker: Mutex<Option<JoinHandle<WorkerReport>>>,
    state: Arc<StateCell>,
    stats: Arc<ConnectionStats>,
    started_at: DateTime<Utc>,
}

/// Handle to a worker thread and the script engine it owns.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a connection backed by the embedded Lua engine.
    ///
    /// The engine is not opened; send an `open` command first.
    pub fn start(config: ConnectionConfig) -> Result<Self, StartError> {
        let engine_config = config.clone();
        Self::start_with(config, move || LuaBackend::from_config(&engine_config))
    }

    /// Start a connection whose engine is built by `factory` on the worker thread.
    pub fn start_with<B, F>(config: ConnectionConfig, factory: F) -> Result<Self, StartError>
    where
        B: ScriptBackend,
        F: FnOnce() -> B + Send + 'static,
    {
        config.validate()?;

        let id = ConnectionId::new();
        let queue = Arc::new(BlockingQueue::new());
        let state = Arc::new(StateCell::default());
        let stats = Arc::new(ConnectionStats::default());

        let handle = worker::spawn(
            id,
            &config,
            Arc::clone(&queue),
            Arc::clone(&state),
            Arc::clone(&stats),
            factory,
        )
        .map_err(|e| {
            tracing::error!(connection_id = %id, error = %e, "Failed to spawn worker thread");
            StartError::ThreadSpawn(e)
        })?;

        tracing::info!(
            connection_id = %id,
            thread = %config.thread_name,
            max_source_bytes = config.max_source_bytes,
            "Connection started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                queue,
                worker: Mutex::new(Some(handle)),
                state,
                stats,
                started_at: Utc::now(),
            }),
        })
    }

    /// Queue a command for the worker.
    ///
    /// Returns once the command is queued; the outcome is delivered to the
    /// command's requester.
    pub fn submit(&self, command: Command) -> Result<(), SubmitError> {
        if let Err(e) = self.check(&command) {
            self.reject(command.id(), &e);
            return Err(e);
        }

        let id = command.id();
        let kind = command.kind();
        match self.shared.queue.push(command) {
            Ok(()) => {
                self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    connection_id = %self.shared.id,
                    correlation_id = %id,
                    kind = %kind,
                    "Command queued"
                );
                Ok(())
            }
            Err(closed) => {
                let e = SubmitError::from(closed);
                self.reject(id, &e);
                Err(e)
            }
        }
    }

    /// Queue an `open`: create the execution context.
    pub fn open(&self, id: CorrelationId, requester: Requester) -> Result<(), SubmitError> {
        self.submit(Command::open(id, requester))
    }

    /// Queue a `close`: destroy the execution context.
    pub fn close(&self, id: CorrelationId, requester: Requester) -> Result<(), SubmitError> {
        self.submit(Command::close(id, requester))
    }

    /// Queue an `eval` of `source`.
    ///
    /// The source is validated before anything is queued: every character
    /// must fit in one byte and the encoded text must fit `max_source_bytes`.
    pub fn eval(
        &self,
        id: CorrelationId,
        requester: Requester,
        source: &str,
    ) -> Result<(), SubmitError> {
        let source = Source::new(source, self.shared.config.max_source_bytes).map_err(|e| {
            self.reject(id, &e);
            e
        })?;
        self.submit(Command::eval(id, requester, source))
    }

    /// Queue a command identified by name, for hosts that receive untyped requests.
    ///
    /// `open`, `close` and `eval` map to the typed operations. Any other name is
    /// queued as an invalid command and answered, in order, with an
    /// `InvalidCommand` failure.
    pub fn submit_named(
        &self,
        kind: &str,
        id: CorrelationId,
        requester: Requester,
        payload: Option<&str>,
    ) -> Result<(), SubmitError> {
        match kind {
            "open" => self.open(id, requester),
            "close" => self.close(id, requester),
            "eval" => match payload {
                Some(source) => self.eval(id, requester, source),
                None => {
                    let e = SubmitError::MissingSource;
                    self.reject(id, &e);
                    Err(e)
                }
            },
            other => self.submit(Command::invalid(id, requester, other)),
        }
    }

    /// Stop the worker and release the engine. See the module docs.
    ///
    /// Blocks until the worker thread has exited. Safe to call more than once
    /// and from several threads; later calls wait for the first to finish.
    pub fn teardown(&self) -> TeardownReport {
        self.shared.teardown()
    }

    /// Get the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Get the start timestamp.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Get the configuration used to start this connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Get the connection statistics.
    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    /// Commands queued but not yet popped by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// False once teardown has begun.
    pub fn is_accepting(&self) -> bool {
        !self.shared.queue.is_sealed()
    }

    /// Current state of the worker thread.
    pub fn worker_state(&self) -> WorkerState {
        self.shared.state.get()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn check(&self, command: &Command) -> Result<(), SubmitError> {
        if !command.requester().is_alive() {
            return Err(SubmitError::InvalidRequester);
        }
        if let Request::Eval(source) = command.request() {
            let limit = self.shared.config.max_source_bytes;
            if source.len() > limit {
                return Err(SubmitError::InputTooLarge {
                    len: source.len(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn reject(&self, id: CorrelationId, error: &SubmitError) {
        self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = %self.shared.id,
            correlation_id = %id,
            error = %error,
            "Submission rejected"
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("worker_state", &self.worker_state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Shared {
    pub(crate) fn teardown(&self) -> TeardownReport {
        // Held for the whole sequence so concurrent callers wait for completion.
        let mut slot = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(handle) = slot.take() else {
            return TeardownReport::default();
        };

        let start = Instant::now();
        tracing::info!(
            connection_id = %self.id,
            pending = self.queue.len(),
            "Tearing down connection"
        );

        if self.queue.seal(Command::shutdown()).is_err() {
            tracing::warn!(connection_id = %self.id, "Queue was already sealed");
        }

        // The last handle can be released by the worker itself, for example by
        // a mailbox that owns a clone. It exits on the `Shutdown` it pops next
        // and reclaims the queue on its way out.
        if handle.thread().id() == thread::current().id() {
            tracing::debug!(connection_id = %self.id, "Teardown on worker thread, not joining");
            return TeardownReport {
                performed: true,
                ..TeardownReport::default()
            };
        }

        let (processed, reclaimed) = match handle.join() {
            Ok(report) => (report.processed, report.abandoned),
            Err(_) => {
                tracing::error!(connection_id = %self.id, "Worker thread panicked");
                (0, 0)
            }
        };

        // A worker that died early left its queue behind.
        let abandoned = reclaimed
            + worker::abandon_queued(
                self.id,
                &self.queue,
                &self.stats,
                self.config.notify_abandoned,
            );

        tracing::info!(
            connection_id = %self.id,
            processed,
            abandoned,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Connection torn down"
        );

        TeardownReport {
            performed: true,
            processed,
            abandoned,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.teardown();
    }
}
