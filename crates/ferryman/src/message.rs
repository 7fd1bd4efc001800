//! Records in flight between a reader and a writer.
//!
//! A [`Message`] carries one source record as an ordered key/value map plus
//! the operation it represents. Messages may carry a [`Confirm`] signal that
//! the sink resolves once the record has been accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::oneshot;

/// Ordered key/value payload of a message.
pub type Data = Map<String, Value>;

/// Operation a message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// New record.
    Insert,
    /// Changed record.
    Update,
    /// Removed record.
    Delete,
}

impl Op {
    /// Wire code used by the commit log.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }

    /// Decodes a commit log wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Delivery mode of a [`MessageSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fire-and-forget bulk copy.
    #[default]
    Async,
    /// Must be durably logged before the source may forget it.
    Sync,
}

impl Mode {
    /// Wire code used by the commit log.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Async => 0,
            Self::Sync => 1,
        }
    }

    /// Decodes a commit log wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Async),
            1 => Some(Self::Sync),
            _ => None,
        }
    }
}

/// One-shot acknowledgement attached to a message.
///
/// Resolving consumes the signal, so it can fire at most once. A signal
/// dropped without being resolved reports the message as abandoned, which
/// keeps the waiting side from hanging.
#[derive(Debug)]
pub struct Confirm(Option<oneshot::Sender<bool>>);

/// Receiving half of a [`Confirm`].
pub type ConfirmReceiver = oneshot::Receiver<bool>;

impl Confirm {
    /// Creates a signal and the receiver that observes it.
    #[must_use]
    pub fn new() -> (Self, ConfirmReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Reports the message as accepted by the sink.
    pub fn resolve(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for Confirm {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(false);
        }
    }
}

/// A single record flowing through a pipeline.
#[derive(Debug)]
pub struct Message {
    /// Operation kind.
    pub op: Op,
    /// Table, collection, type, topic or key the record came from.
    pub namespace: String,
    /// Record payload.
    pub data: Data,
    /// Optional acknowledgement, resolved by the writer.
    pub confirm: Option<Confirm>,
}

impl Message {
    /// Builds a message without a confirm signal.
    pub fn new(op: Op, namespace: impl Into<String>, data: Data) -> Self {
        Self {
            op,
            namespace: namespace.into(),
            data,
            confirm: None,
        }
    }

    /// Builds a message from any JSON value; non-objects land under `value`.
    pub fn from_value(op: Op, namespace: impl Into<String>, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(op, namespace, data)
    }

    /// Attaches a confirm signal and returns the receiver.
    pub fn with_confirm(mut self) -> (Self, ConfirmReceiver) {
        let (confirm, rx) = Confirm::new();
        self.confirm = Some(confirm);
        (self, rx)
    }

    /// Renders the `_id` field, if present.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.data.get("_id").and_then(value_to_id)
    }

    /// Resolves the confirm signal, if one is attached.
    pub fn ack(&mut self) {
        if let Some(confirm) = self.confirm.take() {
            confirm.resolve();
        }
    }

    /// Copies op, namespace and data; the confirm signal stays behind.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::new(self.op, self.namespace.clone(), self.data.clone())
    }
}

/// Renders a JSON scalar as a document id.
pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// A message plus the delivery metadata readers attach to it.
#[derive(Debug)]
pub struct MessageSet {
    /// The record.
    pub msg: Message,
    /// Unix time in milliseconds when the reader produced it.
    pub timestamp: i64,
    /// Delivery mode.
    pub mode: Mode,
}

impl MessageSet {
    /// Wraps a message produced now in async mode.
    #[must_use]
    pub fn new(msg: Message) -> Self {
        Self {
            msg,
            timestamp: chrono::Utc::now().timestamp_millis(),
            mode: Mode::Async,
        }
    }

    /// Wraps a message produced now in sync mode.
    #[must_use]
    pub fn sync(msg: Message) -> Self {
        Self {
            mode: Mode::Sync,
            ..Self::new(msg)
        }
    }
}
