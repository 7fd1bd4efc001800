//! SQL sources: PostgreSQL, MySQL and SQLite.
//!
//! Every table is a namespace. Each table is read with a single streamed
//! `SELECT` whose rows are rendered to JSON by the database itself
//! (`row_to_json`, `JSON_OBJECT`, `json_object`), so column types survive
//! without per-driver decoding. Tables are discovered before the reader
//! hands back its stream; a discovery failure fails the read.
//! PostgreSQL can additionally tail a logical replication slot once the
//! initial copy is done.

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub mod test_decoding;
#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::{factory as mysql_factory, MySql};
#[cfg(feature = "postgres")]
pub use postgres::{factory as postgres_factory, Postgres};
#[cfg(feature = "sqlite")]
pub use sqlite::{factory as sqlite_factory, Sqlite};

use futures::{Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub(crate) use super::common::redact_uri;
use crate::client::{channel, emit, read_fn, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

/// Open connection pool, one variant per database family.
#[derive(Debug, Clone)]
pub enum SqlSession {
    /// PostgreSQL pool.
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
    /// MySQL pool.
    #[cfg(feature = "mysql")]
    MySql(sqlx::MySqlPool),
    /// SQLite pool.
    #[cfg(feature = "sqlite")]
    Sqlite(sqlx::SqlitePool),
}

impl SqlSession {
    /// Lists base tables, sorted. PostgreSQL names are `schema.table`.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let tables = match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT table_schema || '.' || table_name FROM information_schema.tables \
                     WHERE table_type = 'BASE TABLE' \
                     AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                     ORDER BY 1",
                )
                .fetch_all(pool)
                .await?
            }
            #[cfg(feature = "mysql")]
            Self::MySql(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
                     WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
                     ORDER BY 1",
                )
                .fetch_all(pool)
                .await?
            }
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .fetch_all(pool)
                .await?
            }
        };
        Ok(tables)
    }

    /// Column names of `table` in declaration order.
    pub async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let columns = match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                let (schema, name) = split_qualified(table);
                sqlx::query_scalar::<_, String>(
                    "SELECT CAST(column_name AS TEXT) FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await?
            }
            #[cfg(feature = "mysql")]
            Self::MySql(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT CAST(column_name AS CHAR) FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position",
                )
                .bind(table)
                .fetch_all(pool)
                .await?
            }
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                    .bind(table)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(columns)
    }

    /// Query returning every row of `table` as JSON object text.
    #[must_use]
    pub fn select_json(&self, table: &str, columns: &[String]) -> String {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => {
                // row_to_json needs no column list
                let (schema, name) = split_qualified(table);
                format!(
                    "SELECT CAST(row_to_json(t) AS TEXT) FROM {}.{} t",
                    quote_ident(schema, '"'),
                    quote_ident(name, '"')
                )
            }
            #[cfg(feature = "mysql")]
            Self::MySql(_) => format!(
                "SELECT CAST(JSON_OBJECT({}) AS CHAR) FROM {}",
                json_object_args(columns, '`'),
                quote_ident(table, '`')
            ),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => format!(
                "SELECT json_object({}) FROM {}",
                json_object_args(columns, '"'),
                quote_ident(table, '"')
            ),
        }
    }

    /// Closes the pool.
    pub async fn close(&self) {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => pool.close().await,
            #[cfg(feature = "mysql")]
            Self::MySql(pool) => pool.close().await,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
fn split_qualified(table: &str) -> (&str, &str) {
    table.split_once('.').unwrap_or(("public", table))
}

fn quote_ident(ident: &str, quote: char) -> String {
    let escaped = ident.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

#[cfg_attr(not(any(feature = "mysql", feature = "sqlite")), allow(dead_code))]
fn json_object_args(columns: &[String], quote: char) -> String {
    columns
        .iter()
        .map(|c| format!("'{}', {}", c.replace('\'', "''"), quote_ident(c, quote)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_data(row: &str) -> Result<Data> {
    match serde_json::from_str::<Value>(row)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Extraction(format!("row is not an object: {other}"))),
    }
}

/// Copies every table once. Used by the databases that cannot tail.
pub struct TableReader;

impl Reader for TableReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let session = session.into_sql()?;
            let tables = discover_tables(&session, &filter).await?;
            let (tx, rx) = channel();
            tokio::spawn(async move {
                copy_tables(&session, &tables, &tx, &cancel).await;
                info!("read complete");
            });
            Ok(rx)
        })
    }
}

/// Tables accepted by `filter`, in name order.
pub(crate) async fn discover_tables(
    session: &SqlSession,
    filter: &NamespaceFilter,
) -> Result<Vec<String>> {
    let tables = session.list_tables().await?;
    Ok(tables
        .into_iter()
        .filter(|table| {
            let keep = filter.matches(table);
            if !keep {
                debug!(table = %table, "table excluded by namespace filter");
            }
            keep
        })
        .collect())
}

/// Copies `tables` one after the other. A failing table is logged and
/// skipped.
pub(crate) async fn copy_tables(
    session: &SqlSession,
    tables: &[String],
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) {
    for table in tables {
        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }
        info!(table = %table, "copying table");
        match copy_table(session, table, tx, cancel).await {
            Ok(rows) => info!(table = %table, rows, "table done"),
            Err(e) => error!(table = %table, error = %e, "error reading rows"),
        }
    }
}

async fn copy_table(
    session: &SqlSession,
    table: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let columns = session.columns(table).await?;
    if columns.is_empty() {
        debug!(table = %table, "table has no columns");
        return Ok(0);
    }

    let sql = session.select_json(table, &columns);
    match session {
        #[cfg(feature = "postgres")]
        SqlSession::Postgres(pool) => {
            let rows = sqlx::query_scalar::<_, String>(&sql).fetch(pool);
            emit_rows(rows, table, tx, cancel).await
        }
        #[cfg(feature = "mysql")]
        SqlSession::MySql(pool) => {
            let rows = sqlx::query_scalar::<_, String>(&sql).fetch(pool);
            emit_rows(rows, table, tx, cancel).await
        }
        #[cfg(feature = "sqlite")]
        SqlSession::Sqlite(pool) => {
            let rows = sqlx::query_scalar::<_, String>(&sql).fetch(pool);
            emit_rows(rows, table, tx, cancel).await
        }
    }
}

async fn emit_rows<S>(
    mut rows: S,
    table: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<String, sqlx::Error>> + Unpin,
{
    let mut emitted = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!(table = %table, "read cancelled");
                return Ok(emitted);
            }
            next = rows.next() => next,
        };
        let Some(row) = next else {
            return Ok(emitted);
        };
        let set = MessageSet::new(Message::new(Op::Insert, table, row_to_data(&row?)?));
        if !emit(tx, cancel, set).await {
            return Ok(emitted);
        }
        emitted += 1;
    }
}

/// Builds a pool with the configured acquire timeout, mapping failures to
/// [`Error::Connect`].
pub(crate) async fn connect_pool<F, P>(uri: &str, connect: F) -> Result<P>
where
    F: Future<Output = std::result::Result<P, sqlx::Error>>,
{
    connect
        .await
        .map_err(|e| Error::Connect(format!("{}: {e}", redact_uri(uri))))
}

#[cfg(test)]
#[path = "sql_tests.rs"]
mod tests;
