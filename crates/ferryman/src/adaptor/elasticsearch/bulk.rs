//! Batching writer for the `_bulk` API.
//!
//! Messages are turned into bulk actions and appended to an in-memory batch
//! under one lock. The batch is detached and sent when it reaches either the
//! action-count or the byte-size threshold, every flush interval when
//! tailing, and once more on close. The lock only guards the batch itself;
//! HTTP calls happen after it is released.
//!
//! Batches are detached and sent one at a time under a separate async commit
//! guard, so a periodic flush and a write that fills the batch never have two
//! requests in flight and actions reach the cluster in the order written.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clients::Generation;
use super::{EsSession, DEFAULT_BULK_REQUESTS, DEFAULT_REQUEST_SIZE};
use crate::adaptor::common::check_response;
use crate::client::Writer;
use crate::error::{Error, Result};
use crate::message::{value_to_id, Message, Op};
use crate::retry::{with_retry, RetryConfig};

/// Interval of the background flush used by tailing writers.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables for a [`BulkWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Maximum estimated bytes per bulk request.
    pub request_size: usize,
    /// Maximum actions per bulk request.
    pub bulk_requests: usize,
    /// Mapping applied on first write to each index.
    pub mapping: Option<Value>,
    /// Runs the periodic flush task.
    pub tail: bool,
    /// Retries for a failed commit.
    pub commit_retries: u32,
    /// Period of the flush task.
    pub flush_interval: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            request_size: DEFAULT_REQUEST_SIZE,
            bulk_requests: DEFAULT_BULK_REQUESTS,
            mapping: None,
            tail: false,
            commit_retries: 0,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

/// What a failed commit does to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Remember the error, raise the cancellation token, fail later writes.
    Fatal,
    /// Log the error and keep going.
    LogAndContinue,
}

impl From<Generation> for CommitPolicy {
    fn from(generation: Generation) -> Self {
        match generation {
            Generation::Typeless => Self::Fatal,
            Generation::Typed => Self::LogAndContinue,
        }
    }
}

/// One bulk action rendered as NDJSON lines.
#[derive(Debug)]
struct Action {
    index: String,
    doc_type: Option<String>,
    lines: String,
}

#[derive(Debug, Default)]
struct BatchState {
    body: String,
    actions: usize,
    total: u64,
}

impl BatchState {
    fn is_full(&self, options: &WriterOptions) -> bool {
        self.actions >= options.bulk_requests.max(1) || self.body.len() >= options.request_size
    }

    fn take(&mut self) -> Option<Batch> {
        if self.actions == 0 {
            return None;
        }
        Some(Batch {
            body: std::mem::take(&mut self.body),
            actions: std::mem::replace(&mut self.actions, 0),
        })
    }
}

#[derive(Debug)]
struct Batch {
    body: String,
    actions: usize,
}

#[derive(Debug, Clone)]
struct CommitFailure {
    id: String,
    index: String,
    reason: String,
}

impl CommitFailure {
    fn from_error(err: &Error) -> Self {
        match err {
            Error::Commit { id, index, reason } => Self {
                id: id.clone(),
                index: index.clone(),
                reason: reason.clone(),
            },
            other => Self {
                id: String::new(),
                index: String::new(),
                reason: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> Error {
        Error::Commit {
            id: self.id.clone(),
            index: self.index.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_index", default)]
    index: String,
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl BulkResponse {
    fn first_failure(&self) -> Option<Error> {
        self.items
            .iter()
            .flat_map(HashMap::values)
            .find(|item| item.error.is_some() || item.status >= 300)
            .map(|item| Error::Commit {
                id: item.id.clone().unwrap_or_default(),
                index: item.index.clone(),
                reason: describe_item_error(item),
            })
    }
}

fn describe_item_error(item: &BulkItem) -> String {
    match &item.error {
        Some(Value::Object(err)) => {
            let kind = err.get("type").and_then(Value::as_str).unwrap_or("error");
            let reason = err.get("reason").and_then(Value::as_str).unwrap_or_default();
            format!("{kind}: {reason}")
        }
        Some(other) => other.to_string(),
        None => format!("status {}", item.status),
    }
}

struct Shared {
    session: EsSession,
    options: WriterOptions,
    generation: Generation,
    policy: CommitPolicy,
    retry: RetryConfig,
    state: Mutex<BatchState>,
    commit_guard: AsyncMutex<()>,
    applied_mappings: AsyncMutex<HashSet<String>>,
    failure: Mutex<Option<CommitFailure>>,
    cancel: CancellationToken,
}

struct Flusher {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Writer for the `_bulk` API of one cluster.
pub struct BulkWriter {
    shared: Arc<Shared>,
    flusher: Mutex<Option<Flusher>>,
}

impl BulkWriter {
    /// Creates a writer. Tailing writers start their flush task right away
    /// when called inside a tokio runtime.
    pub fn new(
        options: WriterOptions,
        session: EsSession,
        generation: Generation,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            retry: RetryConfig::for_commits(options.commit_retries),
            session,
            options,
            generation,
            policy: CommitPolicy::from(generation),
            state: Mutex::new(BatchState::default()),
            commit_guard: AsyncMutex::new(()),
            applied_mappings: AsyncMutex::new(HashSet::new()),
            failure: Mutex::new(None),
            cancel,
        });
        let flusher = if shared.options.tail {
            spawn_flusher(Arc::clone(&shared))
        } else {
            None
        };
        Self {
            shared,
            flusher: Mutex::new(flusher),
        }
    }

    /// Failure handling in effect for this writer.
    #[must_use]
    pub fn policy(&self) -> CommitPolicy {
        self.shared.policy
    }

    /// Documents committed so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.shared.state.lock().total
    }
}

fn spawn_flusher(shared: Arc<Shared>) -> Option<Flusher> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("no tokio runtime, periodic bulk flush disabled");
        return None;
    };
    let stop = CancellationToken::new();
    let token = stop.clone();
    let period = shared.options.flush_interval;
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = shared.flush().await {
                        warn!(error = %e, "periodic bulk flush failed");
                    }
                }
            }
        }
        debug!("periodic bulk flush stopped");
    });
    Some(Flusher { stop, handle })
}

impl Shared {
    fn check_failed(&self) -> Result<()> {
        match &*self.failure.lock() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn build_action(&self, msg: &mut Message) -> Result<Option<Action>> {
        let id = msg.data.shift_remove("_id").as_ref().and_then(value_to_id);
        let index_override = msg
            .data
            .shift_remove("_index")
            .and_then(|v| v.as_str().map(str::to_string));

        let (index, doc_type) = match self.generation {
            Generation::Typeless => {
                let index = index_override
                    .or_else(|| self.session.index().map(str::to_string))
                    .unwrap_or_else(|| msg.namespace.clone());
                (index, None)
            }
            Generation::Typed => {
                if index_override.is_some() {
                    debug!(namespace = %msg.namespace, "ignoring _index on a typed cluster");
                }
                let index = self
                    .session
                    .index()
                    .map_or_else(|| msg.namespace.clone(), str::to_string);
                (index, Some(msg.namespace.clone()))
            }
        };

        let mut meta = Map::new();
        meta.insert("_index".to_string(), Value::String(index.clone()));
        if let Some(doc_type) = &doc_type {
            meta.insert("_type".to_string(), Value::String(doc_type.clone()));
        }
        if let Some(id) = &id {
            meta.insert("_id".to_string(), Value::String(id.clone()));
        }
        let meta = Value::Object(meta);

        let lines = match (msg.op, &id) {
            (Op::Delete, Some(_)) => format!("{}\n", json!({ "delete": meta })),
            (Op::Delete, None) => {
                warn!(namespace = %msg.namespace, "delete without _id, skipping");
                return Ok(None);
            }
            (Op::Update, Some(_)) => format!(
                "{}\n{}\n",
                json!({ "update": meta }),
                json!({ "doc": &msg.data })
            ),
            (Op::Insert | Op::Update, _) => format!(
                "{}\n{}\n",
                json!({ "index": meta }),
                serde_json::to_string(&msg.data)?
            ),
        };

        Ok(Some(Action {
            index,
            doc_type,
            lines,
        }))
    }

    async fn ensure_mapping(&self, action: &Action) -> Result<()> {
        let Some(mapping) = &self.options.mapping else {
            return Ok(());
        };
        let key = match &action.doc_type {
            Some(doc_type) => format!("{}/{doc_type}", action.index),
            None => action.index.clone(),
        };
        // Held across the PUT so no action for this index is committed first.
        let mut applied = self.applied_mappings.lock().await;
        if applied.contains(&key) {
            return Ok(());
        }

        let result = match &action.doc_type {
            None => self.put_mapping(&action.index, None, mapping).await,
            Some(doc_type) => match mapping.get(doc_type) {
                Some(type_mapping) => {
                    self.put_mapping(&action.index, Some(doc_type), type_mapping)
                        .await
                }
                None => {
                    debug!(doc_type = %doc_type, "no mapping for type, skipping");
                    Ok(())
                }
            },
        };

        if result.is_ok() {
            applied.insert(key);
        }
        result
    }

    async fn put_mapping(&self, index: &str, doc_type: Option<&str>, mapping: &Value) -> Result<()> {
        let create_body = match doc_type {
            Some(doc_type) => json!({ "mappings": { doc_type: mapping } }),
            None => json!({ "mappings": mapping }),
        };
        let response = self
            .session
            .request(Method::PUT, index)
            .json(&create_body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            info!(index = %index, "created index with mapping");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status != StatusCode::BAD_REQUEST || !body.contains("already_exists") {
            return Err(Error::Mapping(format!(
                "create index '{index}' failed with {status}: {body}"
            )));
        }

        let path = match doc_type {
            Some(doc_type) => format!("{index}/_mapping/{doc_type}"),
            None => format!("{index}/_mapping"),
        };
        let response = self
            .session
            .request(Method::PUT, &path)
            .json(mapping)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            info!(index = %index, "applied mapping to existing index");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Mapping(format!(
                "put mapping on '{index}' failed with {status}: {body}"
            )))
        }
    }

    async fn send(&self, body: &str) -> Result<()> {
        let response = self
            .session
            .request(Method::POST, "_bulk")
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body.to_owned())
            .send()
            .await?;
        let reply: BulkResponse = check_response(response, "Elasticsearch")
            .await?
            .json()
            .await?;
        if reply.errors {
            if let Some(err) = reply.first_failure() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn commit(&self, batch: Batch) -> Result<()> {
        let result = if self.options.commit_retries > 0 {
            with_retry(&self.retry, "bulk commit", || self.send(&batch.body)).await
        } else {
            self.send(&batch.body).await
        };

        match result {
            Ok(()) => {
                let total = {
                    let mut state = self.state.lock();
                    state.total += batch.actions as u64;
                    state.total
                };
                info!(actions = batch.actions, total, "bulk request committed");
                Ok(())
            }
            Err(e) => self.on_commit_error(e),
        }
    }

    fn on_commit_error(&self, err: Error) -> Result<()> {
        match self.policy {
            CommitPolicy::LogAndContinue => {
                error!(error = %err, "bulk commit failed, continuing");
                Ok(())
            }
            CommitPolicy::Fatal => {
                error!(error = %err, "bulk commit failed, stopping pipeline");
                *self.failure.lock() = Some(CommitFailure::from_error(&err));
                self.cancel.cancel();
                Err(err)
            }
        }
    }

    /// Detaches the pending batch and commits it. The batch is taken under
    /// the commit guard so batches are sent in the order they were filled.
    async fn flush(&self) -> Result<()> {
        let _turn = self.commit_guard.lock().await;
        let batch = self.state.lock().take();
        match batch {
            Some(batch) => self.commit(batch).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Writer for BulkWriter {
    async fn write(&self, mut msg: Message) -> Result<()> {
        let shared = &self.shared;
        shared.check_failed()?;

        if msg.data.is_empty() {
            msg.ack();
            return Ok(());
        }
        let Some(action) = shared.build_action(&mut msg)? else {
            msg.ack();
            return Ok(());
        };
        shared.ensure_mapping(&action).await?;

        let full_before = shared.state.lock().is_full(&shared.options);
        if full_before {
            shared.flush().await?;
        }

        let full_after = {
            let mut state = shared.state.lock();
            state.body.push_str(&action.lines);
            state.actions += 1;
            state.is_full(&shared.options)
        };
        msg.ack();

        if full_after {
            shared.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            flusher.stop.cancel();
            if let Err(e) = flusher.handle.await {
                warn!(error = %e, "flush task ended abnormally");
            }
        }
        self.shared.flush().await?;
        info!(total = self.total(), "bulk writer closed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "bulk_tests.rs"]
mod tests;
