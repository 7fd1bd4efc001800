//! Document readers for both protocol generations.
//!
//! Typeless clusters (7.x and later) expose one namespace per index. 7.x is
//! paged with `search_after` on `_id`; 8.x disables `_id` fielddata, so it
//! is scrolled in `_doc` order instead. Typed clusters expose one namespace
//! per document type and are paged with scroll contexts.

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clients::{select, CLIENTS};
use super::EsSession;
use crate::adaptor::common::check_response;
use crate::adaptor::Role;
use crate::client::{channel, emit, read_fn, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

/// Documents requested per page.
pub const PAGE_SIZE: usize = 1000;

const SCROLL_KEEPALIVE: &str = "1m";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: HitsContainer,
}

#[derive(Debug, Deserialize)]
struct HitsContainer {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
    #[serde(default)]
    sort: Option<Vec<Value>>,
}

impl Hit {
    fn into_data(self) -> Data {
        let mut data = Map::new();
        data.insert("_id".to_string(), Value::String(self.id));
        if let Some(Value::Object(source)) = self.source {
            data.extend(source);
        }
        data
    }
}

/// Picks the typed or typeless reader once the session's version is known.
pub struct VersionedReader;

impl Reader for VersionedReader {
    fn read(&self, resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let es = session.clone().into_elasticsearch()?;
            let client = select(CLIENTS, &es.version, Role::Reader, &es.display_uri())?;
            let factory = client
                .reader
                .ok_or_else(|| crate::adaptor::unsupported("elasticsearch", Role::Reader))?;
            let inner = factory();
            (inner.read(resume, filter))(session, cancel).await
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Paging {
    SearchAfterId,
    Scroll,
}

/// Reader for 7.x clusters.
pub struct TypelessReader;

impl Reader for TypelessReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_indices(filter, Paging::SearchAfterId)
    }
}

/// Reader for 8.x clusters and OpenSearch.
pub struct ScrollReader;

impl Reader for ScrollReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_indices(filter, Paging::Scroll)
    }
}

fn read_indices(filter: NamespaceFilter, paging: Paging) -> ReadFn {
    read_fn(move |session: Session, cancel: CancellationToken| async move {
        let es = session.into_elasticsearch()?;
        let mapping = fetch_mapping(&es).await?;
        let indices = list_indices(&mapping);
        let (tx, rx) = channel();

        tokio::spawn(async move {
            for index in indices {
                if cancel.is_cancelled() || tx.is_closed() {
                    break;
                }
                if !filter.matches(&index) {
                    info!(index = %index, "index excluded by namespace filter");
                    continue;
                }
                info!(index = %index, ?paging, "copying");
                let result = match paging {
                    Paging::SearchAfterId => scan_index(&es, &index, &tx, &cancel).await,
                    Paging::Scroll => scroll(&es, &index, &index, &tx, &cancel).await,
                };
                if let Err(e) = result {
                    error!(index = %index, error = %e, "error reading index");
                }
            }
            debug!("typeless reader finished");
        });

        Ok(rx)
    })
}

/// Reader for 2.x to 6.x clusters.
pub struct TypedReader;

impl Reader for TypedReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let es = session.into_elasticsearch()?;
            let mapping = fetch_mapping(&es).await?;
            let types = list_types(&mapping);
            let (tx, rx) = channel();

            tokio::spawn(async move {
                for (index, doc_type) in types {
                    if cancel.is_cancelled() || tx.is_closed() {
                        break;
                    }
                    if !filter.matches(&doc_type) {
                        info!(index = %index, doc_type = %doc_type, "type excluded by namespace filter");
                        continue;
                    }
                    info!(index = %index, doc_type = %doc_type, "copying");
                    let path = format!("{index}/{doc_type}");
                    if let Err(e) = scroll(&es, &path, &doc_type, &tx, &cancel).await {
                        error!(doc_type = %doc_type, error = %e, "error reading type");
                    }
                }
                debug!("typed reader finished");
            });

            Ok(rx)
        })
    }
}

async fn fetch_mapping(es: &EsSession) -> Result<Map<String, Value>> {
    let path = match es.index() {
        Some(index) => format!("{index}/_mapping"),
        None => "_mapping".to_string(),
    };
    let response = es
        .request(Method::GET, &path)
        .send()
        .await
        .map_err(|e| Error::Connect(format!("{}: {e}", es.display_uri())))?;
    let response = check_response(response, "Elasticsearch").await?;
    match response.json::<Value>().await? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Extraction(format!("unexpected mapping response: {other}"))),
    }
}

fn list_indices(mapping: &Map<String, Value>) -> Vec<String> {
    let mut indices: Vec<String> = mapping
        .keys()
        .filter(|name| !name.starts_with('.'))
        .cloned()
        .collect();
    indices.sort();
    indices
}

fn list_types(mapping: &Map<String, Value>) -> Vec<(String, String)> {
    let mut types = Vec::new();
    for index in list_indices(mapping) {
        let Some(Value::Object(mappings)) = mapping.get(&index).and_then(|m| m.get("mappings"))
        else {
            continue;
        };
        for doc_type in mappings.keys() {
            if doc_type == "_default_" {
                continue;
            }
            types.push((index.clone(), doc_type.clone()));
        }
    }
    types
}

async fn scan_index(
    es: &EsSession,
    index: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut search_after: Option<Vec<Value>> = None;
    let mut emitted = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut body = json!({
            "size": PAGE_SIZE,
            "query": {"match_all": {}},
            "sort": [{"_id": "asc"}],
        });
        if let Some(after) = &search_after {
            body["search_after"] = Value::Array(after.clone());
        }

        let response = es
            .request(Method::POST, &format!("{index}/_search"))
            .json(&body)
            .send()
            .await?;
        let page: SearchResponse = check_response(response, "Elasticsearch").await?.json().await?;
        let count = page.hits.hits.len();

        for mut hit in page.hits.hits {
            search_after = hit.sort.take();
            let set = MessageSet::new(Message::new(Op::Insert, index, hit.into_data()));
            if !emit(tx, cancel, set).await {
                return Ok(());
            }
            emitted += 1;
        }

        if count < PAGE_SIZE || search_after.is_none() {
            break;
        }
    }

    debug!(index = %index, documents = emitted, "finished index");
    Ok(())
}

/// Scrolls everything under `path` (`index` or `index/type`) into
/// `namespace`.
async fn scroll(
    es: &EsSession,
    path: &str,
    namespace: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Ok(());
    }

    let body = json!({
        "size": PAGE_SIZE,
        "query": {"match_all": {}},
        "sort": ["_doc"],
    });
    let response = es
        .request(
            Method::POST,
            &format!("{path}/_search?scroll={SCROLL_KEEPALIVE}"),
        )
        .json(&body)
        .send()
        .await?;
    let mut page: SearchResponse = check_response(response, "Elasticsearch").await?.json().await?;

    let result = loop {
        let scroll_id = page.scroll_id.take();
        if page.hits.hits.is_empty() {
            break Ok(scroll_id);
        }
        for hit in page.hits.hits {
            let set = MessageSet::new(Message::new(Op::Insert, namespace, hit.into_data()));
            if !emit(tx, cancel, set).await {
                return clear_scroll(es, scroll_id).await;
            }
        }

        let Some(id) = scroll_id else {
            break Ok(None);
        };
        if cancel.is_cancelled() {
            break Ok(Some(id));
        }
        let response = es
            .request(Method::POST, "_search/scroll")
            .json(&json!({"scroll": SCROLL_KEEPALIVE, "scroll_id": id}))
            .send()
            .await;
        match response {
            Ok(response) => match check_response(response, "Elasticsearch").await {
                Ok(response) => page = response.json().await?,
                Err(e) => break Err((e, Some(id))),
            },
            Err(e) => break Err((Error::from(e), Some(id))),
        }
    };

    match result {
        Ok(scroll_id) => clear_scroll(es, scroll_id).await,
        Err((e, scroll_id)) => {
            let _ = clear_scroll(es, scroll_id).await;
            Err(e)
        }
    }
}

async fn clear_scroll(es: &EsSession, scroll_id: Option<String>) -> Result<()> {
    let Some(id) = scroll_id else {
        return Ok(());
    };
    let result = es
        .request(Method::DELETE, "_search/scroll")
        .json(&json!({"scroll_id": [id]}))
        .send()
        .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to clear scroll context");
    }
    Ok(())
}

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;
