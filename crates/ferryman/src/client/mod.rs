//! Connection, reading and writing contracts shared by every adaptor.
//!
//! An adaptor hands out a [`Client`] that opens a [`Session`]. Readers turn
//! a session into a bounded stream of [`MessageSet`]s; writers consume
//! messages and push them to the sink.

mod session;

pub use session::Session;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{Message, MessageSet};
use crate::pipeline::resume::ResumeMap;

/// Capacity of the queue between a reader and its consumer.
pub const READ_BUFFER: usize = 256;

/// Receiving end of a reader's output queue.
pub type MessageStream = mpsc::Receiver<MessageSet>;

/// Starts a read once a session and a cancellation token are available.
pub type ReadFn =
    Box<dyn FnOnce(Session, CancellationToken) -> BoxFuture<'static, Result<MessageStream>> + Send>;

/// Opens and closes connections to a remote system.
#[async_trait]
pub trait Client: Send + Sync {
    /// Connects and returns a session usable by readers and writers.
    async fn connect(&mut self) -> Result<Session>;

    /// Releases the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Produces messages from a source.
pub trait Reader: Send + Sync {
    /// Prepares a read of every namespace accepted by `filter`.
    ///
    /// Readers that cannot resume mid-scan ignore `resume` and start over.
    fn read(&self, resume: ResumeMap, filter: NamespaceFilter) -> ReadFn;
}

/// Consumes messages into a sink.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Accepts one message. Resolves its confirm signal once accepted.
    async fn write(&self, msg: Message) -> Result<()>;

    /// Flushes buffered work and stops background tasks.
    async fn close(&self) -> Result<()>;
}

/// Decides which namespaces a reader iterates.
#[derive(Clone)]
pub struct NamespaceFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl NamespaceFilter {
    /// Wraps a predicate.
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Accepts every namespace.
    #[must_use]
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Accepts namespaces matching `pattern`. Slashes around the pattern
    /// (`/users.*/`) are stripped.
    pub fn from_regex(pattern: &str) -> Result<Self> {
        let trimmed = pattern
            .strip_prefix('/')
            .and_then(|p| p.strip_suffix('/'))
            .unwrap_or(pattern);
        let anchored = format!("^(?:{trimmed})$");
        let re = Regex::new(&anchored)
            .map_err(|e| Error::Config(format!("invalid namespace filter '{pattern}': {e}")))?;
        Ok(Self::new(move |ns| re.is_match(ns)))
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn matches(&self, namespace: &str) -> bool {
        (self.0)(namespace)
    }
}

impl fmt::Debug for NamespaceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamespaceFilter").finish_non_exhaustive()
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Wraps an async closure into a [`ReadFn`].
pub(crate) fn read_fn<F, Fut>(f: F) -> ReadFn
where
    F: FnOnce(Session, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<MessageStream>> + Send + 'static,
{
    Box::new(move |session, cancel| f(session, cancel).boxed())
}

/// Sends one set downstream unless the read was cancelled.
///
/// Returns `false` when the producer must stop: the token was raised, either
/// before or while waiting for queue space, or the consumer went away.
pub(crate) async fn emit(
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
    set: MessageSet,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(set) => sent.is_ok(),
    }
}

/// Builds the output queue for a reader.
pub(crate) fn channel() -> (mpsc::Sender<MessageSet>, MessageStream) {
    mpsc::channel(READ_BUFFER)
}
