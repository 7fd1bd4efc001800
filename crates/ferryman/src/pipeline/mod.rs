//! Single source to single sink wiring.
//!
//! A [`PipelineSpec`] names a source and a sink adaptor with their
//! configuration, an optional namespace filter, the transform chain and an
//! optional commit log:
//!
//! ```yaml
//! source:
//!   type: postgres
//!   config:
//!     uri: postgres://127.0.0.1:5432/shop
//!     tail: true
//!   filter: "public\\..*"
//! sink:
//!   type: elasticsearch
//!   config:
//!     uri: http://localhost:9200/shop
//! functions:
//!   - name: omit
//!     fields: [password]
//! commit_log:
//!   dir: ./ferryman-log
//! ```

pub mod resume;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::{get_adaptor, Adaptor, ConfigMap, Role};
use crate::client::{Client, NamespaceFilter, Writer};
use crate::commitlog::{Checkpoint, CommitLog, DEFAULT_MAX_SEGMENT_BYTES};
use crate::error::{Error, Result};
use crate::function::{Chain, FunctionSpec};
use crate::message::{ConfirmReceiver, Message, MessageSet, Mode};

/// Source side of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Registered adaptor name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Adaptor configuration.
    #[serde(default)]
    pub config: ConfigMap,
    /// Namespace regex; every namespace when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Sink side of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    /// Registered adaptor name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Adaptor configuration.
    #[serde(default)]
    pub config: ConfigMap,
}

/// Commit log location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogSpec {
    /// Directory holding segments and the checkpoint.
    pub dir: PathBuf,
    /// Segment roll size.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
}

fn default_max_segment_bytes() -> u64 {
    DEFAULT_MAX_SEGMENT_BYTES
}

/// Declarative pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Where records come from.
    pub source: SourceSpec,
    /// Where records go.
    pub sink: SinkSpec,
    /// Transforms applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionSpec>,
    /// Durable log for sync-mode records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_log: Option<CommitLogSpec>,
}

impl PipelineSpec {
    /// Parses a YAML description.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid pipeline file: {e}")))
    }

    /// Reads a YAML description from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Renders the description as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Counters reported by [`Pipeline::run`].
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    /// Messages received from the reader, redeliveries included.
    pub read: u64,
    /// Messages accepted by the writer.
    pub written: u64,
    /// Messages dropped by a function or refused by the writer.
    pub failed: u64,
    /// Messages appended to the commit log.
    pub logged: u64,
    /// Log entries redelivered at startup.
    pub replayed: u64,
    /// Wall time in seconds.
    pub duration_secs: f64,
}

impl PipelineStats {
    /// Written messages per second.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.written as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Outcome of checking one role during [`Pipeline::verify`].
#[derive(Debug)]
pub struct RoleCheck {
    /// `source` or `sink`.
    pub side: &'static str,
    /// Adaptor name.
    pub adaptor: String,
    /// Role checked.
    pub role: Role,
    /// Pass or the reason for failure.
    pub result: Result<()>,
}

/// A built pipeline, ready to run.
pub struct Pipeline {
    spec: PipelineSpec,
    source: Box<dyn Adaptor>,
    sink: Box<dyn Adaptor>,
    filter: NamespaceFilter,
    chain: Chain,
    log: Option<Arc<CommitLog>>,
    progress: bool,
}

impl Pipeline {
    /// Builds the adaptors, the function chain and the commit log.
    ///
    /// # Errors
    ///
    /// Any unknown adaptor or function, undecodable configuration, invalid
    /// filter or unusable commit log directory.
    pub fn new(spec: PipelineSpec) -> Result<Self> {
        let source = get_adaptor(&spec.source.kind, &spec.source.config)?;
        let sink = get_adaptor(&spec.sink.kind, &spec.sink.config)?;
        let filter = match &spec.source.filter {
            Some(pattern) => NamespaceFilter::from_regex(pattern)?,
            None => NamespaceFilter::all(),
        };
        let chain = Chain::from_specs(&spec.functions)?;
        let log = spec
            .commit_log
            .as_ref()
            .map(|c| CommitLog::open(&c.dir, c.max_segment_bytes).map(Arc::new))
            .transpose()?;

        Ok(Self {
            spec,
            source,
            sink,
            filter,
            chain,
            log,
            progress: false,
        })
    }

    /// Shows a progress spinner while running.
    #[must_use]
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// The description this pipeline was built from.
    #[must_use]
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Connects to both ends without moving data.
    ///
    /// Every role is checked even when an earlier one failed.
    pub async fn verify(&self) -> Vec<RoleCheck> {
        let mut checks = Vec::new();
        let ends: [(&'static str, &dyn Adaptor, Role); 2] = [
            ("source", self.source.as_ref(), Role::Reader),
            ("sink", self.sink.as_ref(), Role::Writer),
        ];
        for (side, adaptor, role) in ends {
            let check = |role, result| RoleCheck {
                side,
                adaptor: adaptor.name().to_string(),
                role,
                result,
            };
            checks.push(check(Role::Client, adaptor.verify().await));
            let result = match role {
                Role::Reader => adaptor.reader().map(|_| ()),
                _ => verify_writer(adaptor).await,
            };
            checks.push(check(role, result));
        }
        checks
    }

    /// Moves records until the source is exhausted or `cancel` is raised.
    ///
    /// Unconfirmed commit log entries are redelivered first. Sync-mode
    /// messages are appended to the log before they reach the functions,
    /// and the checkpoint follows the writer's confirmations.
    ///
    /// # Errors
    ///
    /// Connection failures and fatal writer errors. Function failures and
    /// non-fatal writer errors are counted in [`PipelineStats::failed`].
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<PipelineStats> {
        let start = Instant::now();
        let mut stats = PipelineStats::default();
        info!(
            source = %self.spec.source.kind,
            sink = %self.spec.sink.kind,
            functions = self.chain.len(),
            "starting pipeline"
        );

        let mut source_client = self.source.client()?;
        let mut sink_client = self.sink.client()?;
        let source_session = source_client.connect().await?;
        let sink_session = match sink_client.connect().await {
            Ok(session) => session,
            Err(e) => {
                close_client(source_client.as_mut(), "source").await;
                return Err(e);
            }
        };
        let writer = self.sink.writer(sink_session, cancel.clone())?;
        let reader = self.source.reader()?;
        let progress = progress_bar(self.progress);

        let (tracker, resume_map, pending) = match &self.log {
            Some(log) => {
                let next = Checkpoint::load(log.dir())?.map_or(0, |c| c.next());
                log.release(next)?;
                let resume_map = resume::load(log, 0)?;
                let backlog = log.next_offset().saturating_sub(next);
                if backlog > 0 {
                    info!(entries = backlog, "redelivering unconfirmed commit log entries");
                }
                let pending = log.read_from(next)?;
                (Some(CheckpointTracker::spawn(Arc::clone(log))), resume_map, Some(pending))
            }
            None => (None, resume::ResumeMap::new(), None),
        };

        let mut fatal = None;
        for entry in pending.into_iter().flatten() {
            if cancel.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            let offset = entry.offset;
            stats.read += 1;
            stats.replayed += 1;
            let (msg, confirm) = entry.into_message_set().msg.with_confirm();
            if let Some(tracker) = &tracker {
                tracker.track(offset, confirm);
            }
            if let Err(e) = self.deliver(writer.as_ref(), msg, &mut stats).await {
                fatal = Some(e);
                break;
            }
            progress.inc(1);
        }

        if fatal.is_none() && !cancel.is_cancelled() {
            let read = reader.read(resume_map, self.filter.clone());
            match read(source_session, cancel.clone()).await {
                Ok(mut stream) => {
                    while let Some(set) = stream.recv().await {
                        stats.read += 1;
                        if let Err(e) = self.accept(writer.as_ref(), set, tracker.as_ref(), &mut stats).await {
                            fatal = Some(e);
                            cancel.cancel();
                            break;
                        }
                        progress.inc(1);
                    }
                }
                Err(e) => fatal = Some(e),
            }
        }

        if let Err(e) = writer.close().await {
            error!(error = %e, "error closing writer");
            fatal.get_or_insert(e);
        }
        drop(writer);
        if let Some(tracker) = tracker {
            if let Some(offset) = tracker.finish().await {
                debug!(offset, "final checkpoint");
            }
        }
        close_client(source_client.as_mut(), "source").await;
        close_client(sink_client.as_mut(), "sink").await;

        stats.duration_secs = start.elapsed().as_secs_f64();
        progress.finish_with_message("done");
        info!(
            read = stats.read,
            written = stats.written,
            failed = stats.failed,
            logged = stats.logged,
            "pipeline finished in {:.2}s ({:.0} msg/sec)",
            stats.duration_secs,
            stats.throughput()
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Logs a sync-mode set, then delivers its message.
    async fn accept(
        &self,
        writer: &dyn Writer,
        set: MessageSet,
        tracker: Option<&CheckpointTracker>,
        stats: &mut PipelineStats,
    ) -> Result<()> {
        let msg = match (&self.log, tracker, set.mode) {
            (Some(log), Some(tracker), Mode::Sync) => {
                let offset = log.append(&set)?;
                stats.logged += 1;
                let (msg, confirm) = set.msg.with_confirm();
                tracker.track(offset, confirm);
                msg
            }
            _ => set.msg,
        };
        self.deliver(writer, msg, stats).await
    }

    /// Runs the chain and hands the result to the writer. Only fatal
    /// writer errors are returned.
    async fn deliver(
        &self,
        writer: &dyn Writer,
        msg: Message,
        stats: &mut PipelineStats,
    ) -> Result<()> {
        let namespace = msg.namespace.clone();
        let msg = match self.chain.apply(msg) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "dropping message");
                stats.failed += 1;
                return Ok(());
            }
        };
        match writer.write(msg).await {
            Ok(()) => {
                stats.written += 1;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(namespace = %namespace, error = %e, "writer failed");
                stats.failed += 1;
                Err(e)
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "message not written");
                stats.failed += 1;
                Ok(())
            }
        }
    }
}

async fn verify_writer(adaptor: &dyn Adaptor) -> Result<()> {
    if !adaptor.roles().contains(&Role::Writer) {
        return Err(crate::adaptor::unsupported(adaptor.name(), Role::Writer));
    }
    let mut client = adaptor.client()?;
    let session = client.connect().await?;
    let built = adaptor.writer(session, CancellationToken::new());
    let closed = match &built {
        Ok(writer) => writer.close().await,
        Err(_) => Ok(()),
    };
    let _ = client.close().await;
    built.map(|_| ()).and(closed)
}

async fn close_client(client: &mut dyn Client, side: &str) {
    if let Err(e) = client.close().await {
        warn!(side, error = %e, "error closing client");
    }
}

/// Advances the checkpoint as logged messages are confirmed, in log order.
///
/// The first message reported abandoned freezes the checkpoint, so it and
/// everything after it is redelivered on the next start.
struct CheckpointTracker {
    tx: mpsc::UnboundedSender<(u64, ConfirmReceiver)>,
    handle: JoinHandle<Option<u64>>,
}

impl CheckpointTracker {
    fn spawn(log: Arc<CommitLog>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(track_confirms(log, rx));
        Self { tx, handle }
    }

    fn track(&self, offset: u64, confirm: ConfirmReceiver) {
        if self.tx.send((offset, confirm)).is_err() {
            warn!(offset, "checkpoint tracker stopped");
        }
    }

    /// Waits for outstanding confirmations; returns the stored offset.
    async fn finish(self) -> Option<u64> {
        drop(self.tx);
        self.handle.await.unwrap_or_else(|e| {
            error!(error = %e, "checkpoint tracker panicked");
            None
        })
    }
}

async fn track_confirms(
    log: Arc<CommitLog>,
    mut rx: mpsc::UnboundedReceiver<(u64, ConfirmReceiver)>,
) -> Option<u64> {
    let mut confirmed = None;
    let mut stored = None;
    let mut frozen = false;
    while let Some((offset, confirm)) = rx.recv().await {
        if frozen {
            continue;
        }
        match confirm.await {
            Ok(true) => confirmed = Some(offset),
            _ => {
                warn!(offset, "message not confirmed, checkpoint frozen");
                frozen = true;
            }
        }
        if rx.is_empty() && confirmed != stored {
            stored = store_checkpoint(&log, confirmed);
        }
    }
    if confirmed != stored {
        stored = store_checkpoint(&log, confirmed);
    }
    stored
}

/// Stores the mark, then lets go of the segments it covers.
fn store_checkpoint(log: &CommitLog, offset: Option<u64>) -> Option<u64> {
    let offset = offset?;
    if let Err(e) = Checkpoint::new(offset).store(log.dir()) {
        error!(offset, error = %e, "unable to store checkpoint");
        return None;
    }
    if let Err(e) = log.release(offset + 1) {
        warn!(offset, error = %e, "unable to release commit log segments");
    }
    Some(offset)
}

fn progress_bar(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} messages ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
