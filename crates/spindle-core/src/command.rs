//! Commands: one requested operation, its correlation token and its requester.
//!
//! A command is built by a producer, moved into the queue and consumed exactly
//! once by the worker. Its fields are private, so nothing can change it after
//! it has been pushed.

use crate::error::SubmitError;
use crate::mailbox::{Outcome, Reply, Requester};
use crate::value::{decode_latin1, encode_latin1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token echoed back in the reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

impl CorrelationId {
    /// Allocate a process-unique id, for callers that do not bring their own.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Script source, validated as single-byte text within a size budget.
#[derive(Clone, PartialEq, Eq)]
pub struct Source(Vec<u8>);

impl Source {
    /// Encode `text` one byte per character, rejecting anything that does not fit.
    pub fn new(text: &str, limit: usize) -> Result<Self, SubmitError> {
        let bytes =
            encode_latin1(text).map_err(|(ch, position)| SubmitError::InvalidInput { ch, position })?;
        if bytes.len() > limit {
            return Err(SubmitError::InputTooLarge {
                len: bytes.len(),
                limit,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({:?})", decode_latin1(&self.0))
    }
}

/// Kind of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Open,
    Close,
    Eval,
    Shutdown,
    /// A kind name that was not recognized.
    Invalid(String),
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::Eval => write!(f, "eval"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Invalid(name) => write!(f, "invalid({name})"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Request {
    Open,
    Close,
    Eval(Source),
    Shutdown,
    Invalid(String),
}

/// One requested operation.
#[derive(Debug)]
pub struct Command {
    id: CorrelationId,
    requester: Requester,
    request: Request,
}

impl Command {
    pub fn open(id: CorrelationId, requester: Requester) -> Self {
        Self {
            id,
            requester,
            request: Request::Open,
        }
    }

    pub fn close(id: CorrelationId, requester: Requester) -> Self {
        Self {
            id,
            requester,
            request: Request::Close,
        }
    }

    pub fn eval(id: CorrelationId, requester: Requester, source: Source) -> Self {
        Self {
            id,
            requester,
            request: Request::Eval(source),
        }
    }

    /// A command whose kind name was not understood. The worker answers it
    /// with an `InvalidCommand` failure, in order.
    pub fn invalid(id: CorrelationId, requester: Requester, name: impl Into<String>) -> Self {
        Self {
            id,
            requester,
            request: Request::Invalid(name.into()),
        }
    }

    pub(crate) fn shutdown() -> Self {
        Self {
            id: CorrelationId(0),
            requester: Requester::detached(),
            request: Request::Shutdown,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn kind(&self) -> CommandKind {
        match &self.request {
            Request::Open => CommandKind::Open,
            Request::Close => CommandKind::Close,
            Request::Eval(_) => CommandKind::Eval,
            Request::Shutdown => CommandKind::Shutdown,
            Request::Invalid(name) => CommandKind::Invalid(name.clone()),
        }
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    /// Consume the command, delivering `outcome` to its requester.
    pub(crate) fn respond(self, outcome: Outcome) -> bool {
        self.requester.deliver(Reply {
            id: self.id,
            outcome,
        })
    }
}
