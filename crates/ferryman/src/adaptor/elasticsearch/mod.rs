//! Elasticsearch/OpenSearch source and sink.
//!
//! The cluster version is probed on connect and decides which protocol
//! generation the reader and writer speak; see [`clients`].

pub mod bulk;
pub mod clients;
pub mod reader;
pub mod uri;
pub mod version;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use self::bulk::WriterOptions;
use self::clients::{select, CLIENTS};
use self::reader::VersionedReader;
use self::uri::{redact, ClusterUri};
use super::common::create_http_client;
use super::config::{parse_duration, DEFAULT_TIMEOUT};
use super::{Adaptor, Role, ALL_ROLES};
use crate::client::{Client, Reader, Session, Writer};
use crate::error::Result;

/// Default bulk request size in bytes (512 KiB).
pub const DEFAULT_REQUEST_SIZE: usize = 2 << 18;

/// Default number of actions per bulk request.
pub const DEFAULT_BULK_REQUESTS: usize = 1000;

const DESCRIPTION: &str = "an elasticsearch source/sink adaptor";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "http://localhost:9200/index"
  // "timeout": "10s", // defaults to 30s
  // "username": "elastic",
  // "password": "changeme",
  // "tail": false, // periodic flush for continuous pipelines
  // "request_size": 524288,
  // "bulk_requests": 1000,
  // "commit_retries": 0,
  // "mapping": {"properties": {"title": {"type": "text"}}}
}"#;

/// Elasticsearch adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Elasticsearch {
    /// Cluster URI, optionally with credentials and target index.
    pub uri: String,
    /// Transport timeout.
    pub timeout: String,
    /// Basic auth user, overrides the URI userinfo.
    pub username: Option<String>,
    /// Basic auth password, overrides the URI userinfo.
    pub password: Option<String>,
    /// Enables the periodic flush used by continuous pipelines.
    pub tail: bool,
    /// Maximum estimated bytes per bulk request.
    pub request_size: usize,
    /// Maximum actions per bulk request.
    pub bulk_requests: usize,
    /// Retries for a failed bulk commit.
    pub commit_retries: u32,
    /// Index mapping applied on first write to an index.
    pub mapping: Option<Value>,
}

impl Default for Elasticsearch {
    fn default() -> Self {
        Self {
            uri: "http://localhost:9200".to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            username: None,
            password: None,
            tail: false,
            request_size: DEFAULT_REQUEST_SIZE,
            bulk_requests: DEFAULT_BULK_REQUESTS,
            commit_retries: 0,
            mapping: None,
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Elasticsearch::default())
}

impl Elasticsearch {
    fn target(&self) -> Result<ClusterUri> {
        let mut target = ClusterUri::parse(&self.uri)?;
        if let Some(user) = &self.username {
            target.username = Some(user.clone());
            target.password.clone_from(&self.password);
        }
        Ok(target)
    }

    fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            request_size: self.request_size,
            bulk_requests: self.bulk_requests,
            mapping: self.mapping.clone(),
            tail: self.tail,
            commit_retries: self.commit_retries,
            ..WriterOptions::default()
        }
    }
}

#[async_trait]
impl Adaptor for Elasticsearch {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn roles(&self) -> &'static [Role] {
        ALL_ROLES
    }

    fn client(&self) -> Result<Box<dyn Client>> {
        Ok(Box::new(EsClient {
            target: self.target()?,
            timeout: parse_duration(&self.timeout)?,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(VersionedReader))
    }

    fn writer(&self, session: Session, cancel: CancellationToken) -> Result<Box<dyn Writer>> {
        let session = session.into_elasticsearch()?;
        let client = select(CLIENTS, &session.version, Role::Writer, &session.display_uri())?;
        let factory = client
            .writer
            .ok_or_else(|| super::unsupported(self.name(), Role::Writer))?;
        factory(self.writer_options(), session, cancel)
    }
}

/// Client that probes the cluster version on connect.
pub struct EsClient {
    target: ClusterUri,
    timeout: std::time::Duration,
}

#[async_trait]
impl Client for EsClient {
    async fn connect(&mut self) -> Result<Session> {
        let http = create_http_client(self.timeout)?;
        let version = version::detect(&http, &self.target).await?;
        Ok(Session::Elasticsearch(EsSession {
            http,
            target: self.target.clone(),
            version,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open cluster connection.
#[derive(Debug, Clone)]
pub struct EsSession {
    /// Shared HTTP client.
    pub http: reqwest::Client,
    /// Parsed cluster URI.
    pub target: ClusterUri,
    /// Detected server version.
    pub version: Version,
}

impl EsSession {
    /// Builds an authenticated request against the primary host.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.target.primary(), path.trim_start_matches('/'));
        let mut request = self.http.request(method, url);
        if let Some(user) = &self.target.username {
            request = request.basic_auth(user, self.target.password.as_deref());
        }
        request
    }

    /// Target index from the URI path, if any.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        self.target.index.as_deref()
    }

    /// Primary host with credentials hidden.
    #[must_use]
    pub fn display_uri(&self) -> String {
        redact(self.target.primary())
    }
}
