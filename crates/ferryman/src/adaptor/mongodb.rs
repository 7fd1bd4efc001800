//! MongoDB sink over the Atlas Data API (REST).
//!
//! The message namespace is the collection. Inserts that hit an existing
//! `_id` fall back to a replace of that document; updates replace the
//! document matching `_id` and deletes remove it.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::common::{create_http_client, handle_http_error, validate_scheme};
use super::config::{parse_duration, DEFAULT_TIMEOUT};
use super::{Adaptor, Role, SINK_ROLES};
use crate::client::{Client, Session, Writer};
use crate::error::{Error, Result};
use crate::message::{Message, Op};

/// Data source name of an Atlas cluster.
pub const DEFAULT_DATA_SOURCE: &str = "mongodb-atlas";

const DESCRIPTION: &str = "a mongodb sink adaptor";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1",
  "api_key": "${MONGODB_API_KEY}",
  "database": "ferryman"
  // "data_source": "mongodb-atlas",
  // "timeout": "30s"
}"#;

/// MongoDB adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoDb {
    /// Data API endpoint.
    pub uri: String,
    /// Data API key.
    pub api_key: String,
    /// Cluster name as the Data API knows it.
    pub data_source: String,
    /// Target database.
    pub database: String,
    /// Request timeout.
    pub timeout: String,
}

impl Default for MongoDb {
    fn default() -> Self {
        Self {
            uri: String::new(),
            api_key: String::new(),
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            database: String::new(),
            timeout: DEFAULT_TIMEOUT.to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(MongoDb::default())
}

#[async_trait]
impl Adaptor for MongoDb {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn roles(&self) -> &'static [Role] {
        SINK_ROLES
    }

    fn client(&self) -> Result<Box<dyn Client>> {
        validate_scheme(&self.uri, &["http", "https"])?;
        if self.database.is_empty() {
            return Err(Error::Config("mongodb database must be set".to_string()));
        }
        Ok(Box::new(MongoClient {
            config: self.clone(),
            timeout: parse_duration(&self.timeout)?,
        }))
    }

    fn writer(&self, session: Session, _cancel: CancellationToken) -> Result<Box<dyn Writer>> {
        Ok(Box::new(MongoWriter {
            session: session.into_mongodb()?,
        }))
    }
}

/// Builds sessions for the configured Data API endpoint.
pub struct MongoClient {
    config: MongoDb,
    timeout: Duration,
}

#[async_trait]
impl Client for MongoClient {
    /// Checks the key against the endpoint with a one-document read.
    async fn connect(&mut self) -> Result<Session> {
        let session = MongoSession {
            http: create_http_client(self.timeout)?,
            api_url: self.config.uri.trim_end_matches('/').to_string(),
            api_key: self.config.api_key.clone(),
            data_source: self.config.data_source.clone(),
            database: self.config.database.clone(),
        };
        session
            .action("findOne", "ferryman", json!({"filter": {}}))
            .await
            .map_err(|e| match e {
                Error::Authentication(_) => e,
                other => Error::Connect(format!("mongodb data api {}: {other}", session.api_url)),
            })?;
        Ok(Session::MongoDb(session))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Authenticated handle on one database behind the Data API.
#[derive(Debug, Clone)]
pub struct MongoSession {
    /// Shared HTTP client.
    pub http: reqwest::Client,
    /// Endpoint without trailing slash.
    pub api_url: String,
    api_key: String,
    /// Cluster name.
    pub data_source: String,
    /// Target database.
    pub database: String,
}

/// Outcome of one Data API call.
#[derive(Debug)]
enum Outcome {
    Done(Value),
    Duplicate,
}

impl MongoSession {
    /// Posts `action` for `collection`; `body` carries the action's own
    /// fields.
    async fn action(&self, action: &str, collection: &str, body: Value) -> Result<Value> {
        match self.call(action, collection, body).await? {
            Outcome::Done(value) => Ok(value),
            Outcome::Duplicate => Err(Error::Extraction(format!(
                "{action} on {collection}: duplicate key"
            ))),
        }
    }

    async fn call(&self, action: &str, collection: &str, mut body: Value) -> Result<Outcome> {
        body["dataSource"] = json!(self.data_source);
        body["database"] = json!(self.database);
        body["collection"] = json!(collection);

        let response = self
            .http
            .post(format!("{}/action/{action}", self.api_url))
            .header("Content-Type", "application/json")
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(Outcome::Done(response.json().await?));
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if is_duplicate(status, &text) {
            return Ok(Outcome::Duplicate);
        }
        Err(handle_http_error(status.as_u16(), &text, "MongoDB"))
    }
}

/// Duplicate key rejections come back as 409 or carry the server's E11000
/// code in the body.
fn is_duplicate(status: StatusCode, body: &str) -> bool {
    status == StatusCode::CONFLICT || body.contains("E11000") || body.contains("DuplicateKey")
}

/// Writes each message with a single Data API call.
pub struct MongoWriter {
    session: MongoSession,
}

impl MongoWriter {
    fn id_filter(msg: &Message) -> Result<Value> {
        msg.data
            .get("_id")
            .map(|id| json!({"_id": id}))
            .ok_or_else(|| {
                Error::Extraction(format!("{:?} on {} without _id", msg.op, msg.namespace))
            })
    }

    async fn replace(&self, msg: &Message) -> Result<()> {
        self.session
            .action(
                "replaceOne",
                &msg.namespace,
                json!({"filter": Self::id_filter(msg)?, "replacement": msg.data}),
            )
            .await
            .map(drop)
    }
}

#[async_trait]
impl Writer for MongoWriter {
    async fn write(&self, mut msg: Message) -> Result<()> {
        match msg.op {
            Op::Insert => {
                let inserted = self
                    .session
                    .call("insertOne", &msg.namespace, json!({"document": msg.data}))
                    .await?;
                if let Outcome::Duplicate = inserted {
                    debug!(collection = %msg.namespace, id = ?msg.id(), "document exists, replacing");
                    self.replace(&msg).await?;
                }
            }
            Op::Update => self.replace(&msg).await?,
            Op::Delete => {
                self.session
                    .action("deleteOne", &msg.namespace, json!({"filter": Self::id_filter(&msg)?}))
                    .await?;
            }
        }
        msg.ack();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("mongodb writer closed");
        Ok(())
    }
}
