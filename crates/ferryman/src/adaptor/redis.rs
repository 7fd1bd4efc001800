//! Redis source.
//!
//! Each key is a namespace. Keys are enumerated with `SCAN`, their type is
//! looked up with `TYPE` and the value is read with the matching command.
//! Values stay strings.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{parse_duration, DEFAULT_TIMEOUT};
use super::{Adaptor, Role, SOURCE_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

/// Default endpoint.
pub const DEFAULT_URI: &str = "redis://127.0.0.1:6379/0";

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

const DESCRIPTION: &str = "a redis source adaptor";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "redis://127.0.0.1:6379/0"
  // "timeout": "30s",
  // "pattern": "*" // SCAN MATCH pattern
}"#;

/// Redis adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Redis {
    /// Connection URI, including the database number.
    pub uri: String,
    /// Connection and response timeout.
    pub timeout: String,
    /// Glob passed to `SCAN MATCH`.
    pub pattern: String,
}

impl Default for Redis {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            pattern: "*".to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Redis::default())
}

#[async_trait]
impl Adaptor for Redis {
    fn name(&self) -> &'static str {
        "redis"
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
        let client = redis::Client::open(self.uri.as_str())
            .map_err(|e| Error::InvalidUri(format!("{}: {e}", self.uri)))?;
        Ok(Box::new(RedisClient {
            client,
            timeout: parse_duration(&self.timeout)?,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(RedisReader {
            pattern: self.pattern.clone(),
        }))
    }
}

/// Opens multiplexed connections.
pub struct RedisClient {
    client: redis::Client,
    timeout: Duration,
}

#[async_trait]
impl Client for RedisClient {
    async fn connect(&mut self) -> Result<Session> {
        let conn = if self.timeout.is_zero() {
            self.client.get_multiplexed_async_connection().await
        } else {
            self.client
                .get_multiplexed_async_connection_with_timeouts(self.timeout, self.timeout)
                .await
        }
        .map_err(|e| Error::Connect(format!("redis: {e}")))?;
        let db = self.client.get_connection_info().redis.db;
        Ok(Session::Redis(RedisSession { conn, db }))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open Redis connection.
#[derive(Clone)]
pub struct RedisSession {
    /// Multiplexed connection, cheap to clone.
    pub conn: MultiplexedConnection,
    /// Selected database.
    pub db: i64,
}

impl fmt::Debug for RedisSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSession").field("db", &self.db).finish_non_exhaustive()
    }
}

/// Value of one key, by Redis type.
#[derive(Debug, Clone, PartialEq)]
enum KeyValue {
    String(String),
    Hash(BTreeMap<String, String>),
    List(Vec<String>),
    Set(Vec<String>),
    ZSet(BTreeMap<String, String>),
}

impl KeyValue {
    /// Strings, lists and sets are stored under the key itself; hashes and
    /// sorted sets spread their fields (members map to scores).
    fn into_data(self, key: &str) -> Data {
        let mut data = Data::new();
        match self {
            Self::String(value) => {
                data.insert(key.to_string(), Value::String(value));
            }
            Self::List(items) | Self::Set(items) => {
                data.insert(
                    key.to_string(),
                    Value::Array(items.into_iter().map(Value::String).collect()),
                );
            }
            Self::Hash(fields) | Self::ZSet(fields) => {
                data.extend(fields.into_iter().map(|(k, v)| (k, Value::String(v))));
            }
        }
        data
    }
}

/// Streams every key of the selected database.
pub struct RedisReader {
    pattern: String,
}

impl Reader for RedisReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        let pattern = self.pattern.clone();
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let session = session.into_redis()?;
            let (tx, rx) = channel();

            tokio::spawn(async move {
                let db = session.db;
                info!(db, "scanning keys");
                if let Err(e) = scan_keys(session, &pattern, &filter, &tx, &cancel).await {
                    error!(db, error = %e, "unable to scan keys");
                }
                info!(db, "scan complete");
            });

            Ok(rx)
        })
    }
}

async fn scan_keys(
    session: RedisSession,
    pattern: &str,
    filter: &NamespaceFilter,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut conn = session.conn;
    let mut cursor: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut conn)
            .await?;

        for key in keys {
            if !filter.matches(&key) {
                debug!(key = %key, "skipping key");
                continue;
            }
            let value = match fetch(&mut conn, &key).await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    warn!(key = %key, "unsupported key type, skipping");
                    continue;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "error while fetching data");
                    continue;
                }
            };
            let set = MessageSet::new(Message::new(Op::Insert, key.as_str(), value.into_data(&key)));
            if !emit(tx, cancel, set).await {
                return Ok(());
            }
        }

        if next == 0 {
            return Ok(());
        }
        cursor = next;
    }
}

async fn fetch(conn: &mut MultiplexedConnection, key: &str) -> Result<Option<KeyValue>> {
    let kind: String = redis::cmd("TYPE").arg(key).query_async(conn).await?;
    let value = match kind.as_str() {
        "string" => {
            let value: String = redis::cmd("GET").arg(key).query_async(conn).await?;
            KeyValue::String(value)
        }
        "hash" => KeyValue::Hash(redis::cmd("HGETALL").arg(key).query_async(conn).await?),
        "list" => KeyValue::List(
            redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(conn)
                .await?,
        ),
        "set" => KeyValue::Set(redis::cmd("SMEMBERS").arg(key).query_async(conn).await?),
        "zset" => KeyValue::ZSet(
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(conn)
                .await?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(value))
}
