//! PostgreSQL source with optional logical replication tailing.
//!
//! Tailing peeks at the slot without consuming it. Changes are consumed only
//! once every row of their transaction has been handed to the pipeline, so a
//! cancelled poll leaves the rest of the batch in the slot for the next run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::test_decoding::{is_commit, parse_change};
use super::{connect_pool, copy_tables, discover_tables, redact_uri, SqlSession};
use crate::adaptor::config::{parse_duration, DEFAULT_TIMEOUT};
use crate::adaptor::{Adaptor, Role, SOURCE_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Message, MessageSet};
use crate::pipeline::resume::ResumeMap;

/// Changes fetched per poll of the replication slot.
pub const PEEK_LIMIT: i32 = 500;

const DESCRIPTION: &str = "a postgres source adaptor that can tail a logical replication slot";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "postgres://127.0.0.1:5432/test"
  // "timeout": "30s",
  // "ssl": false, // require TLS; when false and the uri sets no sslmode, TLS is disabled
  // "tail": false,
  // "replication_slot": "standby_replication_slot", // test_decoding slot used when tailing
  // "poll_interval": "1s"
}"#;

/// PostgreSQL adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Postgres {
    /// Connection URI.
    pub uri: String,
    /// Pool acquire timeout.
    pub timeout: String,
    /// Require TLS.
    pub ssl: bool,
    /// Keep streaming changes from `replication_slot` after the copy.
    pub tail: bool,
    /// Logical replication slot using the `test_decoding` plugin.
    pub replication_slot: String,
    /// Delay between two polls of the slot.
    pub poll_interval: String,
}

impl Default for Postgres {
    fn default() -> Self {
        Self {
            uri: "postgres://127.0.0.1:5432/test".to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            ssl: false,
            tail: false,
            replication_slot: "standby_replication_slot".to_string(),
            poll_interval: "1s".to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Postgres::default())
}

#[async_trait]
impl Adaptor for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn roles(&self) -> &'static [Role] {
        SOURCE_ROLES
    }

    fn client(&self) -> Result<Box<dyn Client>> {
        Ok(Box::new(PostgresClient {
            uri: self.uri.clone(),
            options: connect_options(&self.uri, self.ssl)?,
            timeout: parse_duration(&self.timeout)?,
            pool: None,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        let slot = if self.tail {
            if self.replication_slot.is_empty() {
                return Err(Error::Config(
                    "tailing postgres requires a replication_slot".to_string(),
                ));
            }
            Some(self.replication_slot.clone())
        } else {
            None
        };
        Ok(Box::new(PostgresReader {
            slot,
            poll_interval: parse_duration(&self.poll_interval)?,
        }))
    }
}

/// Opens a connection pool.
pub struct PostgresClient {
    uri: String,
    options: PgConnectOptions,
    timeout: Duration,
    pool: Option<PgPool>,
}

#[async_trait]
impl Client for PostgresClient {
    async fn connect(&mut self) -> Result<Session> {
        if self.pool.is_none() {
            let options = PgPoolOptions::new().max_connections(4).acquire_timeout(self.timeout);
            let connect = options.connect_with(self.options.clone());
            self.pool = Some(connect_pool(&self.uri, connect).await?);
        }
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::Connect("postgres pool unavailable".to_string()))?;
        Ok(Session::Sql(SqlSession::Postgres(pool)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

/// Parses `uri` and applies the TLS setting. `ssl` forces `require`; without
/// it TLS is disabled unless the URI names its own `sslmode`.
fn connect_options(uri: &str, ssl: bool) -> Result<PgConnectOptions> {
    let options = PgConnectOptions::from_str(uri)
        .map_err(|e| Error::InvalidUri(format!("{}: {e}", redact_uri(uri))))?;
    if ssl {
        Ok(options.ssl_mode(PgSslMode::Require))
    } else if uri.contains("sslmode=") {
        Ok(options)
    } else {
        Ok(options.ssl_mode(PgSslMode::Disable))
    }
}

/// Copies every table, then tails the replication slot when one is set.
pub struct PostgresReader {
    slot: Option<String>,
    poll_interval: Duration,
}

impl Reader for PostgresReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        let slot = self.slot.clone();
        let poll_interval = self.poll_interval;
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let session = session.into_sql()?;
            let SqlSession::Postgres(pool) = session.clone() else {
                return Err(Error::SessionMismatch {
                    expected: "postgres",
                    actual: "sql",
                });
            };
            if let Some(slot) = &slot {
                ensure_slot(&pool, slot).await?;
            }
            let tables = discover_tables(&session, &filter).await?;
            let (tx, rx) = channel();

            tokio::spawn(async move {
                copy_tables(&session, &tables, &tx, &cancel).await;
                let Some(slot) = slot else {
                    info!("read complete");
                    return;
                };
                info!(slot = %slot, "copy complete, tailing replication slot");
                tail_slot(&pool, &slot, poll_interval, &filter, &tx, &cancel).await;
            });

            Ok(rx)
        })
    }
}

async fn ensure_slot(pool: &PgPool, slot: &str) -> Result<()> {
    let plugin: Option<String> =
        sqlx::query_scalar("SELECT CAST(plugin AS TEXT) FROM pg_replication_slots WHERE slot_name = $1")
            .bind(slot)
            .fetch_optional(pool)
            .await?;
    match plugin.as_deref() {
        Some("test_decoding") => Ok(()),
        Some(other) => Err(Error::Config(format!(
            "replication slot '{slot}' uses plugin '{other}', expected test_decoding"
        ))),
        None => Err(Error::Config(format!("replication slot '{slot}' does not exist"))),
    }
}

/// Decodes a polled batch into the sets to emit, each tagged with the index
/// of its line. Markers, undecodable lines and filtered tables yield nothing.
fn decode_batch(lines: &[String], filter: &NamespaceFilter) -> Vec<(usize, MessageSet)> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            let change = match parse_change(line) {
                Ok(Some(change)) => change,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable change");
                    return None;
                }
            };
            if !filter.matches(&change.namespace) {
                debug!(table = %change.namespace, "skipping change");
                return None;
            }
            let msg = Message::new(change.op, change.namespace, change.data);
            Some((index, MessageSet::sync(msg)))
        })
        .collect()
}

/// Number of leading lines that can be consumed from the slot once the
/// first `handled` lines were handed over: everything up to the last
/// `COMMIT` among them, or the whole batch when all of it was handled.
fn settled_lines(lines: &[String], handled: usize) -> usize {
    if handled >= lines.len() {
        return lines.len();
    }
    lines[..handled]
        .iter()
        .rposition(|line| is_commit(line))
        .map_or(0, |last| last + 1)
}

async fn peek_changes(pool: &PgPool, slot: &str) -> Result<Vec<String>> {
    let lines = sqlx::query_scalar("SELECT data FROM pg_logical_slot_peek_changes($1, NULL, $2)")
        .bind(slot)
        .bind(PEEK_LIMIT)
        .fetch_all(pool)
        .await?;
    Ok(lines)
}

/// Consumes the first `count` peeked lines. The slot stops on transaction
/// boundaries, which `settled_lines` guarantees `count` falls on.
async fn consume_changes(pool: &PgPool, slot: &str, count: usize) -> Result<()> {
    let limit = i32::try_from(count).unwrap_or(i32::MAX);
    let consumed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM pg_logical_slot_get_changes($1, NULL, $2)")
            .bind(slot)
            .bind(limit)
            .fetch_one(pool)
            .await?;
    debug!(slot = %slot, consumed, "advanced replication slot");
    Ok(())
}

async fn tail_slot(
    pool: &PgPool,
    slot: &str,
    poll_interval: Duration,
    filter: &NamespaceFilter,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            info!(slot = %slot, "tailing stopped");
            return;
        }
        let lines = match peek_changes(pool, slot).await {
            Ok(lines) => lines,
            Err(e) => {
                error!(slot = %slot, error = %e, "error polling replication slot");
                Vec::new()
            }
        };

        let mut handled = lines.len();
        for (index, set) in decode_batch(&lines, filter) {
            if !emit(tx, cancel, set).await {
                handled = index;
                break;
            }
        }

        let settled = settled_lines(&lines, handled);
        if settled > 0 {
            if let Err(e) = consume_changes(pool, slot, settled).await {
                error!(slot = %slot, error = %e, "error advancing replication slot");
            }
        }
        if handled < lines.len() {
            info!(slot = %slot, pending = lines.len() - settled, "tailing stopped");
            return;
        }

        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}
