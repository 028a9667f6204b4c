//! The dedicated thread that owns an engine and drains its command queue.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──spawn──▶ Running ──Shutdown popped──▶ Draining ──engine closed──▶ Terminated
//! ```
//!
//! While `Running` the worker blocks in `queue.pop()`, runs each command on
//! the engine and replies to its requester before popping the next one. It
//! leaves the loop only when it pops `Shutdown`; every other failure,
//! including a panicking backend, becomes an error reply. On the way out it
//! reclaims whatever is still queued behind `Shutdown`.
//!
//! If the thread dies anyway (a panicking engine factory, say), an exit guard
//! seals the queue and publishes `Terminated`, so later submissions fail with
//! `QueueClosed` instead of waiting on a thread that is gone.

use crate::command::{Command, Request};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionId, ConnectionStats};
use crate::engine::{EngineHandle, ScriptBackend};
use crate::error::EngineError;
use crate::mailbox::{Outcome, ReplyStatus};
use crate::queue::BlockingQueue;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, not yet looping.
    Idle = 0,
    /// Processing commands.
    Running = 1,
    /// `Shutdown` received, releasing the engine.
    Draining = 2,
    /// The thread has returned.
    Terminated = 3,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Shared, lock-free view of a worker's state.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Summary returned by a worker thread when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Commands dispatched, not counting `Shutdown`.
    pub processed: u64,
    /// Commands found queued behind `Shutdown` and discarded unexecuted.
    pub abandoned: usize,
}

pub(crate) struct Worker<B: ScriptBackend> {
    connection_id: ConnectionId,
    queue: Arc<BlockingQueue<Command>>,
    engine: EngineHandle<B>,
    state: Arc<StateCell>,
    stats: Arc<ConnectionStats>,
    notify_abandoned: bool,
}

/// Publishes `Terminated` when the worker thread ends, however it ends.
struct ExitGuard {
    connection_id: ConnectionId,
    queue: Arc<BlockingQueue<Command>>,
    state: Arc<StateCell>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(
                connection_id = %self.connection_id,
                pending = self.queue.len(),
                "Worker thread panicked, closing queue"
            );
            let _ = self.queue.seal(Command::shutdown());
        }
        self.state.set(WorkerState::Terminated);
    }
}

/// Spawn the worker thread. The backend is built on that thread by `factory`
/// and never leaves it.
pub(crate) fn spawn<B, F>(
    connection_id: ConnectionId,
    config: &ConnectionConfig,
    queue: Arc<BlockingQueue<Command>>,
    state: Arc<StateCell>,
    stats: Arc<ConnectionStats>,
    factory: F,
) -> io::Result<JoinHandle<WorkerReport>>
where
    B: ScriptBackend,
    F: FnOnce() -> B + Send + 'static,
{
    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }

    let notify_abandoned = config.notify_abandoned;
    builder.spawn(move || {
        let _guard = ExitGuard {
            connection_id,
            queue: Arc::clone(&queue),
            state: Arc::clone(&state),
        };
        let worker = Worker {
            connection_id,
            queue,
            engine: EngineHandle::new(factory()),
            state,
            stats,
            notify_abandoned,
        };
        worker.run()
    })
}

impl<B: ScriptBackend> Worker<B> {
    fn run(mut self) -> WorkerReport {
        self.state.set(WorkerState::Running);
        tracing::debug!(
            connection_id = %self.connection_id,
            backend = self.engine.backend_name(),
            "Worker loop started"
        );

        let mut processed = 0u64;
        loop {
            let command = self.queue.pop();
            if let Request::Shutdown = command.request() {
                tracing::debug!(connection_id = %self.connection_id, "Shutdown received");
                break;
            }

            let id = command.id();
            let start = Instant::now();
            let outcome = self.dispatch_guarded(command.request());
            processed += 1;

            match outcome.status() {
                ReplyStatus::Ok => self.stats.completed.fetch_add(1, Ordering::Relaxed),
                _ => self.stats.failed.fetch_add(1, Ordering::Relaxed),
            };
            tracing::debug!(
                connection_id = %self.connection_id,
                correlation_id = %id,
                kind = %command.kind(),
                status = %outcome.status(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "Command completed"
            );

            if !respond_guarded(self.connection_id, command, outcome) {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    correlation_id = %id,
                    "Requester gone, reply dropped"
                );
            }
        }

        self.state.set(WorkerState::Draining);
        let abandoned = abandon_queued(
            self.connection_id,
            &self.queue,
            &self.stats,
            self.notify_abandoned,
        );
        self.engine.close();
        self.state.set(WorkerState::Terminated);
        tracing::debug!(
            connection_id = %self.connection_id,
            processed,
            abandoned,
            "Worker loop exited"
        );

        WorkerReport {
            processed,
            abandoned,
        }
    }

    /// Run one command, turning a backend panic into an error reply.
    fn dispatch_guarded(&mut self, request: &Request) -> Outcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    connection_id = %self.connection_id,
                    panic = %message,
                    "Engine panicked, closing context"
                );
                self.engine.poison();
                Outcome::Failed(EngineError::Panicked(message))
            }
        }
    }

    fn dispatch(&mut self, request: &Request) -> Outcome {
        match request {
            Request::Open => match self.engine.open() {
                Ok(()) => Outcome::Done,
                Err(e) => {
                    tracing::warn!(connection_id = %self.connection_id, error = %e, "Engine open failed");
                    Outcome::Failed(e)
                }
            },
            Request::Close => {
                self.engine.close();
                Outcome::Done
            }
            Request::Eval(source) => {
                tracing::trace!(connection_id = %self.connection_id, source = ?source, "Evaluating");
                match self.engine.eval(source) {
                    Ok(Ok(value)) => Outcome::Value(value),
                    Ok(Err(thrown)) => Outcome::Thrown(thrown),
                    Err(e) => Outcome::Failed(e),
                }
            }
            Request::Invalid(name) => {
                tracing::warn!(connection_id = %self.connection_id, kind = %name, "Invalid command");
                Outcome::Failed(EngineError::InvalidCommand(name.clone()))
            }
            // Consumed by the run loop before dispatch.
            Request::Shutdown => Outcome::Failed(EngineError::InvalidCommand("shutdown".into())),
        }
    }
}

/// Deliver `outcome` to the command's requester. A panicking mailbox counts
/// as one that is gone.
pub(crate) fn respond_guarded(
    connection_id: ConnectionId,
    command: Command,
    outcome: Outcome,
) -> bool {
    let id = command.id();
    match panic::catch_unwind(AssertUnwindSafe(move || command.respond(outcome))) {
        Ok(delivered) => delivered,
        Err(payload) => {
            tracing::error!(
                connection_id = %connection_id,
                correlation_id = %id,
                panic = %panic_message(payload.as_ref()),
                "Mailbox panicked, reply dropped"
            );
            false
        }
    }
}

/// Seal the queue and discard everything left in it except the `Shutdown`
/// marker. With `notify`, each discarded command is answered `Cancelled`.
pub(crate) fn abandon_queued(
    connection_id: ConnectionId,
    queue: &BlockingQueue<Command>,
    stats: &ConnectionStats,
    notify: bool,
) -> usize {
    let leftovers: Vec<Command> = queue
        .drain()
        .into_iter()
        .filter(|command| !matches!(command.request(), Request::Shutdown))
        .collect();
    let abandoned = leftovers.len();
    for command in leftovers {
        stats.abandoned.fetch_add(1, Ordering::Relaxed);
        if notify {
            respond_guarded(connection_id, command, Outcome::Cancelled);
        }
    }
    if abandoned > 0 {
        tracing::warn!(
            connection_id = %connection_id,
            abandoned,
            notified = notify,
            "Discarded commands queued behind shutdown"
        );
    }
    abandoned
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), WorkerState::Idle);
        for state in [
            WorkerState::Running,
            WorkerState::Draining,
            WorkerState::Terminated,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_worker_state_display() {
        assert_eq!(format!("{}", WorkerState::Idle), "Idle");
        assert_eq!(format!("{}", WorkerState::Running), "Running");
        assert_eq!(format!("{}", WorkerState::Draining), "Draining");
        assert_eq!(format!("{}", WorkerState::Terminated), "Terminated");
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
