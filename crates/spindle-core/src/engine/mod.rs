//! The single-threaded execution context and its lifecycle.
//!
//! A [`ScriptBackend`] is an embedded interpreter that is not thread-safe.
//! [`EngineHandle`] wraps exactly one backend and enforces the
//! `Uninitialized → Open → Closed` state machine around it. The handle is
//! created on the worker thread and never leaves it.

pub mod lua;

use crate::command::Source;
use crate::error::EngineError;
use crate::value::TaggedValue;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// An embedded script interpreter.
///
/// Implementations need not be `Send`: the worker builds its backend on its
/// own thread from a factory closure.
pub trait ScriptBackend: 'static {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Allocate the execution context and install the built-in functions.
    fn open(&mut self) -> Result<(), EngineError>;

    /// Destroy the execution context, releasing all interpreter memory.
    fn close(&mut self);

    /// Evaluate `source`, classifying either the result or the raised error.
    fn eval(&mut self, source: &Source) -> Result<TaggedValue, TaggedValue>;
}

/// Lifecycle state of an [`EngineHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Open,
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Exclusive owner of one execution context.
pub struct EngineHandle<B: ScriptBackend> {
    backend: B,
    state: EngineState,
}

impl<B: ScriptBackend> EngineHandle<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: EngineState::Uninitialized,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Create the execution context.
    ///
    /// Opening an already open handle discards the current context and starts
    /// a fresh one. On failure from `Uninitialized` the handle stays
    /// `Uninitialized`; a failed re-open leaves it `Closed`.
    pub fn open(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Open {
            tracing::debug!(backend = self.backend.name(), "Re-opening engine, discarding context");
            self.backend.close();
            self.state = EngineState::Closed;
        }
        self.backend.open()?;
        self.state = EngineState::Open;
        Ok(())
    }

    /// Destroy the execution context. A no-op unless the handle is open.
    pub fn close(&mut self) {
        if self.state == EngineState::Open {
            self.backend.close();
            self.state = EngineState::Closed;
        }
    }

    /// Tear down a context whose backend panicked mid-operation.
    ///
    /// The backend's own state can no longer be trusted, so the handle ends up
    /// `Closed` even if `close` panics as well.
    pub(crate) fn poison(&mut self) {
        if self.state == EngineState::Open {
            let backend = &mut self.backend;
            let _ = panic::catch_unwind(AssertUnwindSafe(|| backend.close()));
        }
        if self.state != EngineState::Uninitialized {
            self.state = EngineState::Closed;
        }
    }

    /// Evaluate `source`. Fails fast unless the handle is open.
    pub fn eval(&mut self, source: &Source) -> Result<Result<TaggedValue, TaggedValue>, EngineError> {
        if self.state != EngineState::Open {
            return Err(EngineError::NotOpen { state: self.state });
        }
        Ok(self.backend.eval(source))
    }
}

impl<B: ScriptBackend> Drop for EngineHandle<B> {
    fn drop(&mut self) {
        self.close();
    }
}
