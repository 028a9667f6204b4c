//! Reply routing.
//!
//! The core never knows who its callers are. Each command carries a
//! [`Requester`], an opaque capability that can deliver a [`Reply`] to
//! wherever the caller is listening: a tokio channel, a std channel, a
//! socket session. Delivery never blocks the worker.

use crate::command::CorrelationId;
use crate::error::EngineError;
use crate::value::TaggedValue;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::sync::{mpsc, Arc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Coarse status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Cancelled,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Open or close succeeded.
    Done,
    /// Eval succeeded with this value.
    Value(TaggedValue),
    /// The script raised or failed to parse; the error is classified like any value.
    Thrown(TaggedValue),
    /// The engine could not run the command.
    Failed(EngineError),
    /// The command was abandoned at teardown without running.
    Cancelled,
}

impl Outcome {
    /// Status marker distinguishing a successful `Null` from a thrown error.
    pub fn status(&self) -> ReplyStatus {
        match self {
            Self::Done | Self::Value(_) => ReplyStatus::Ok,
            Self::Thrown(_) | Self::Failed(_) => ReplyStatus::Error,
            Self::Cancelled => ReplyStatus::Cancelled,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == ReplyStatus::Ok
    }

    /// The tagged value carried by `Value` or `Thrown`.
    pub fn value(&self) -> Option<&TaggedValue> {
        match self {
            Self::Value(v) | Self::Thrown(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", &self.status())?;
        match self {
            Self::Value(v) | Self::Thrown(v) => map.serialize_entry("value", v)?,
            Self::Failed(e) => map.serialize_entry("error", e)?,
            Self::Done | Self::Cancelled => {}
        }
        map.end()
    }
}

/// A reply addressed to one requester.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Reply {
    /// Correlation id exactly as supplied at submission.
    pub id: CorrelationId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Reply {
    pub fn status(&self) -> ReplyStatus {
        self.outcome.status()
    }
}

/// Something that can receive replies.
pub trait Mailbox: Send + Sync + 'static {
    /// Hand a reply over without blocking. Returns false if it could not be delivered.
    fn deliver(&self, reply: Reply) -> bool;

    /// Whether replies can still reach this mailbox.
    fn is_alive(&self) -> bool {
        true
    }
}

impl Mailbox for UnboundedSender<Reply> {
    fn deliver(&self, reply: Reply) -> bool {
        self.send(reply).is_ok()
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }
}

impl Mailbox for mpsc::Sender<Reply> {
    fn deliver(&self, reply: Reply) -> bool {
        self.send(reply).is_ok()
    }
}

// Sink for control commands that nobody waits on.
struct Detached;

impl Mailbox for Detached {
    fn deliver(&self, _reply: Reply) -> bool {
        false
    }

    fn is_alive(&self) -> bool {
        false
    }
}

/// Opaque, cheaply clonable address of a caller.
#[derive(Clone)]
pub struct Requester(Arc<dyn Mailbox>);

impl Requester {
    pub fn new(mailbox: impl Mailbox) -> Self {
        Self(Arc::new(mailbox))
    }

    pub(crate) fn detached() -> Self {
        Self::new(Detached)
    }

    pub(crate) fn deliver(&self, reply: Reply) -> bool {
        self.0.deliver(reply)
    }

    pub fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl From<UnboundedSender<Reply>> for Requester {
    fn from(tx: UnboundedSender<Reply>) -> Self {
        Self::new(tx)
    }
}

impl From<mpsc::Sender<Reply>> for Requester {
    fn from(tx: mpsc::Sender<Reply>) -> Self {
        Self::new(tx)
    }
}

/// Create a requester together with the inbox its replies arrive in.
pub fn mailbox() -> (Requester, UnboundedReceiver<Reply>) {
    let (tx, rx) = unbounded_channel();
    (Requester::from(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;

    #[test]
    fn test_outcome_status() {
        assert_eq!(Outcome::Done.status(), ReplyStatus::Ok);
        assert_eq!(Outcome::Value(TaggedValue::Null).status(), ReplyStatus::Ok);
        assert_eq!(
            Outcome::Thrown(TaggedValue::String("boom".into())).status(),
            ReplyStatus::Error
        );
        assert_eq!(
            Outcome::Failed(EngineError::InvalidCommand("x".into())).status(),
            ReplyStatus::Error
        );
        assert_eq!(Outcome::Cancelled.status(), ReplyStatus::Cancelled);
    }

    #[test]
    fn test_reply_serialized_shape() {
        let reply = Reply {
            id: CorrelationId::from(7),
            outcome: Outcome::Value(TaggedValue::Number(4.0)),
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({
                "id": 7,
                "status": "ok",
                "value": {"type": "number", "value": 4.0}
            })
        );

        let reply = Reply {
            id: CorrelationId::from(8),
            outcome: Outcome::Failed(EngineError::NotOpen {
                state: EngineState::Uninitialized,
            }),
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({
                "id": 8,
                "status": "error",
                "error": {"reason": "not_open", "detail": {"state": "uninitialized"}}
            })
        );
    }

    #[test]
    fn test_tokio_mailbox_liveness() {
        let (requester, rx) = mailbox();
        assert!(requester.is_alive());
        drop(rx);
        assert!(!requester.is_alive());
        assert!(!requester.deliver(Reply {
            id: CorrelationId::from(1),
            outcome: Outcome::Done,
        }));
    }

    #[test]
    fn test_std_mailbox_delivers() {
        let (tx, rx) = mpsc::channel();
        let requester = Requester::from(tx);
        assert!(requester.deliver(Reply {
            id: CorrelationId::from(3),
            outcome: Outcome::Done,
        }));
        assert_eq!(rx.recv().unwrap().id, CorrelationId::from(3));
    }

    #[test]
    fn test_detached_is_never_alive() {
        assert!(!Requester::detached().is_alive());
    }
}
