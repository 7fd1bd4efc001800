//! Firestore source over the REST API.
//!
//! Top-level collections are the namespaces. Documents are paged with
//! `pageToken` and their typed field values are decoded into plain JSON.
//! The document id is exposed as `_id`.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::common::{check_response, create_http_client};
use super::config::{parse_duration, DEFAULT_TIMEOUT};
use super::{Adaptor, Role, SOURCE_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

/// Public Firestore endpoint.
pub const DEFAULT_BASE_URI: &str = "https://firestore.googleapis.com";

/// Default service account key file.
pub const DEFAULT_SAC_PATH: &str = "ServiceAccountKey.json";

/// Documents requested per page.
const PAGE_SIZE: usize = 300;

const DESCRIPTION: &str = "a firestore source adaptor";

const SAMPLE_CONFIG: &str = r#"{
  "sac_path": "ServiceAccountKey.json",
  "project_id": "sample-project"
  // "access_token": "ya29...", // OAuth2 bearer token
  // "uri": "http://localhost:8080", // emulator or proxy endpoint
  // "timeout": "30s"
}"#;

/// Firestore adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Firestore {
    /// REST endpoint.
    pub uri: String,
    /// Request timeout.
    pub timeout: String,
    /// Service account key, read for its `project_id` when none is set.
    pub sac_path: String,
    /// Project id.
    pub project_id: String,
    /// OAuth2 bearer token.
    pub access_token: Option<String>,
    /// Database id.
    pub database: String,
}

impl Default for Firestore {
    fn default() -> Self {
        Self {
            uri: DEFAULT_BASE_URI.to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            sac_path: DEFAULT_SAC_PATH.to_string(),
            project_id: String::new(),
            access_token: None,
            database: "(default)".to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Firestore::default())
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
    project_id: String,
}

fn project_from_sac(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read service account {}: {e}", path.display())))?;
    let account: ServiceAccount = serde_json::from_str(&content)?;
    info!(project = %account.project_id, sac_path = %path.display(), "obtained service account project");
    Ok(account.project_id)
}

#[async_trait]
impl Adaptor for Firestore {
    fn name(&self) -> &'static str {
        "firestore"
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
        Ok(Box::new(FirestoreClient {
            config: self.clone(),
            timeout: parse_duration(&self.timeout)?,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(FirestoreReader))
    }
}

/// Resolves the project and checks the endpoint answers.
pub struct FirestoreClient {
    config: Firestore,
    timeout: Duration,
}

#[async_trait]
impl Client for FirestoreClient {
    async fn connect(&mut self) -> Result<Session> {
        let project = if self.config.project_id.is_empty() {
            project_from_sac(Path::new(&self.config.sac_path))?
        } else {
            self.config.project_id.clone()
        };
        let session = FirestoreSession {
            http: create_http_client(self.timeout)?,
            documents_url: format!(
                "{}/v1/projects/{project}/databases/{}/documents",
                self.config.uri.trim_end_matches('/'),
                self.config.database
            ),
            access_token: self.config.access_token.clone(),
        };
        session
            .list_collections(Some(1), None)
            .await
            .map_err(|e| Error::Connect(format!("firestore project '{project}': {e}")))?;
        Ok(Session::Firestore(session))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Authenticated handle on one Firestore database.
#[derive(Debug, Clone)]
pub struct FirestoreSession {
    /// Shared HTTP client.
    pub http: reqwest::Client,
    /// `.../databases/{db}/documents` root.
    pub documents_url: String,
    /// Bearer token, if any.
    pub access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionIds {
    #[serde(default)]
    collection_ids: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentPage {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl Document {
    fn into_data(self) -> Data {
        let id = self.name.rsplit('/').next().unwrap_or_default().to_string();
        let mut data = Data::new();
        data.insert("_id".to_string(), Value::String(id));
        for (key, value) in self.fields {
            data.insert(key, decode_value(value));
        }
        data
    }
}

impl FirestoreSession {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn list_collections(
        &self,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<CollectionIds> {
        let mut body = json!({});
        if let Some(size) = page_size {
            body["pageSize"] = json!(size);
        }
        if let Some(token) = page_token {
            body["pageToken"] = json!(token);
        }
        let url = format!("{}:listCollectionIds", self.documents_url);
        let response = self.request(Method::POST, &url).json(&body).send().await?;
        Ok(check_response(response, "Firestore").await?.json().await?)
    }

    async fn all_collections(&self) -> Result<Vec<String>> {
        let mut collections = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_collections(None, token.as_deref()).await?;
            collections.extend(page.collection_ids);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => return Ok(collections),
            }
        }
    }

    async fn documents(&self, collection: &str, page_token: Option<&str>) -> Result<DocumentPage> {
        let url = format!("{}/{collection}", self.documents_url);
        let mut request = self
            .request(Method::GET, &url)
            .query(&[("pageSize", PAGE_SIZE.to_string())]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let response = request.send().await?;
        Ok(check_response(response, "Firestore").await?.json().await?)
    }
}

/// Decodes a Firestore typed value into plain JSON.
pub fn decode_value(value: Value) -> Value {
    let Value::Object(mut typed) = value else {
        return value;
    };
    let Some(key) = typed.keys().next().cloned() else {
        return Value::Null;
    };
    let inner = typed.remove(&key).unwrap_or(Value::Null);
    match key.as_str() {
        "nullValue" => Value::Null,
        "integerValue" => match &inner {
            Value::String(s) => s.parse::<i64>().map_or(inner.clone(), Value::from),
            _ => inner,
        },
        "mapValue" => {
            let fields = match inner {
                Value::Object(mut map) => match map.remove("fields") {
                    Some(Value::Object(fields)) => fields,
                    _ => Map::new(),
                },
                _ => Map::new(),
            };
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, decode_value(v)))
                    .collect(),
            )
        }
        "arrayValue" => {
            let values = match inner {
                Value::Object(mut map) => match map.remove("values") {
                    Some(Value::Array(values)) => values,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            Value::Array(values.into_iter().map(decode_value).collect())
        }
        // string, double, boolean, timestamp, reference, bytes and geo points
        _ => inner,
    }
}

/// Streams documents from every top-level collection.
pub struct FirestoreReader;

impl Reader for FirestoreReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let session = session.into_firestore()?;
            let collections = session.all_collections().await?;
            let (tx, rx) = channel();

            tokio::spawn(async move {
                for collection in collections {
                    if cancel.is_cancelled() || tx.is_closed() {
                        break;
                    }
                    if !filter.matches(&collection) {
                        info!(collection = %collection, "collection excluded by namespace filter");
                        continue;
                    }
                    info!(collection = %collection, "copying");
                    if let Err(e) = iterate_collection(&session, &collection, &tx, &cancel).await {
                        error!(collection = %collection, error = %e, "error reading collection");
                    }
                }
            });

            Ok(rx)
        })
    }
}

async fn iterate_collection(
    session: &FirestoreSession,
    collection: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut token: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let page = session.documents(collection, token.as_deref()).await?;
        for document in page.documents {
            let set = MessageSet::new(Message::new(Op::Insert, collection, document.into_data()));
            if !emit(tx, cancel, set).await {
                return Ok(());
            }
        }
        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => return Ok(()),
        }
    }
}
