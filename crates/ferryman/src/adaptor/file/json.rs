//! JSON and JSON-lines files.
//!
//! `json` reads a file holding one object or an array of objects. `jsonl`
//! reads one document per line. Both write one document per line, to a file
//! or to standard output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{FileClient, FileTarget};
use crate::adaptor::config::{parse_duration, DEFAULT_TIMEOUT};
use crate::adaptor::{Adaptor, Role, ALL_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session, Writer};
use crate::error::{Error, Result};
use crate::message::{Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

const JSON_SAMPLE_CONFIG: &str = r#"{
  "uri": "/path/to/file.json", // or stdout:// when used as a sink
  "type_name": "jsonType" // namespace for every document, defaults to the file name
}"#;

const JSONL_SAMPLE_CONFIG: &str = r#"{
  "uri": "/path/to/file.jsonl", // or stdout:// when used as a sink
  "type_name": "jsonlType" // namespace for every document, defaults to the file name
}"#;

macro_rules! json_adaptor {
    (
        $(#[$doc:meta])*
        $ty:ident, $name:literal, $lines:literal, $description:literal, $sample:ident, $factory:ident
    ) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $ty {
            /// Local path, `file://` URI, http(s) URL or `stdout://`.
            pub uri: String,
            /// Download timeout for remote files.
            pub timeout: String,
            /// Namespace for every document read.
            pub type_name: String,
        }

        impl Default for $ty {
            fn default() -> Self {
                Self {
                    uri: super::STDOUT_URI.to_string(),
                    timeout: DEFAULT_TIMEOUT.to_string(),
                    type_name: String::new(),
                }
            }
        }

        #[doc = concat!("Registry factory for `", $name, "`.")]
        pub fn $factory() -> Box<dyn Adaptor> {
            Box::new($ty::default())
        }

        #[async_trait]
        impl Adaptor for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn description(&self) -> &'static str {
                $description
            }

            fn sample_config(&self) -> &'static str {
                $sample
            }

            fn roles(&self) -> &'static [Role] {
                ALL_ROLES
            }

            fn client(&self) -> Result<Box<dyn Client>> {
                Ok(Box::new(FileClient::new(
                    &self.uri,
                    &self.type_name,
                    parse_duration(&self.timeout)?,
                    true,
                )))
            }

            fn reader(&self) -> Result<Box<dyn Reader>> {
                Ok(Box::new(JsonReader { lines: $lines }))
            }

            fn writer(&self, session: Session, _cancel: CancellationToken) -> Result<Box<dyn Writer>> {
                let file = session.into_file()?;
                Ok(Box::new(JsonWriter::open(&file.target)?))
            }
        }
    };
}

json_adaptor!(
    /// Whole-document JSON adaptor.
    Json,
    "json",
    false,
    "an adaptor that reads / writes json files",
    JSON_SAMPLE_CONFIG,
    json_factory
);

json_adaptor!(
    /// JSON-lines adaptor.
    Jsonl,
    "jsonl",
    true,
    "an adaptor that reads / writes json-lines files",
    JSONL_SAMPLE_CONFIG,
    jsonl_factory
);

/// Streams documents out of a JSON or JSON-lines file.
pub struct JsonReader {
    lines: bool,
}

impl Reader for JsonReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        let lines = self.lines;
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let file = session.into_file()?;
            let path = file.path()?.to_path_buf();
            let namespace = file.type_name;
            let (tx, rx) = channel();

            tokio::spawn(async move {
                if !filter.matches(&namespace) {
                    info!(type_name = %namespace, "file excluded by namespace filter");
                    return;
                }
                info!(file = %path.display(), "reading file");
                let result = if lines {
                    read_lines(&path, &namespace, &tx, &cancel).await
                } else {
                    read_document(&path, &namespace, &tx, &cancel).await
                };
                match result {
                    Ok(count) => info!(file = %path.display(), documents = count, "read complete"),
                    Err(e) => error!(file = %path.display(), error = %e, "error reading file"),
                }
            });

            Ok(rx)
        })
    }
}

async fn read_document(
    path: &Path,
    namespace: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let content = tokio::fs::read(path).await?;
    let trimmed = content.trim_ascii_start();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let documents = match serde_json::from_slice::<Value>(trimmed)? {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(Error::Extraction(format!(
                "expected an object or an array, got {other}"
            )))
        }
    };

    let mut count = 0;
    for document in documents {
        let set = MessageSet::new(Message::from_value(Op::Insert, namespace, document));
        if !emit(tx, cancel, set).await {
            info!(file = %path.display(), "read cancelled");
            break;
        }
        count += 1;
    }
    Ok(count)
}

async fn read_lines(
    path: &Path,
    namespace: &str,
    tx: &mpsc::Sender<MessageSet>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let document: Value = serde_json::from_str(&line)
            .map_err(|e| Error::Extraction(format!("line {line_no}: {e}")))?;
        let set = MessageSet::new(Message::from_value(Op::Insert, namespace, document));
        if !emit(tx, cancel, set).await {
            info!(file = %path.display(), "read cancelled");
            break;
        }
        count += 1;
    }
    Ok(count)
}

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Appends one JSON document per line.
pub struct JsonWriter {
    out: tokio::sync::Mutex<Sink>,
}

impl JsonWriter {
    /// Opens `target` for appending.
    pub fn open(target: &FileTarget) -> Result<Self> {
        let out: Sink = match target {
            FileTarget::Stdout => Box::new(tokio::io::stdout()),
            FileTarget::Local(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Box::new(tokio::io::BufWriter::new(tokio::fs::File::from_std(file)))
            }
        };
        Ok(Self {
            out: tokio::sync::Mutex::new(out),
        })
    }
}

#[async_trait]
impl Writer for JsonWriter {
    async fn write(&self, mut msg: Message) -> Result<()> {
        let mut line = serde_json::to_vec(&msg.data)?;
        line.push(b'\n');
        self.out.lock().await.write_all(&line).await?;
        msg.ack();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.out.lock().await.flush().await?;
        debug!("json writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::file::FileSession;
    use serde_json::json;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    async fn read_all(lines: bool, session: FileSession) -> Vec<MessageSet> {
        let read = JsonReader { lines }.read(ResumeMap::new(), NamespaceFilter::all());
        let mut stream = read(Session::File(session), CancellationToken::new()).await.unwrap();
        let mut out = Vec::new();
        while let Some(set) = stream.recv().await {
            out.push(set);
        }
        out
    }

    #[tokio::test]
    async fn test_json_array_document() {
        let file = file_with(r#"  [{"id": 1, "name": "ada"}, {"id": 2}, 3]"#);
        let sets = read_all(false, FileSession::local(file.path(), "people")).await;
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].msg.data.get("name"), Some(&json!("ada")));
        assert_eq!(sets[2].msg.data.get("value"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_json_single_object() {
        let file = file_with(r#"{"id": "only"}"#);
        let sets = read_all(false, FileSession::local(file.path(), "doc")).await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].msg.id(), Some("only".to_string()));
    }

    #[tokio::test]
    async fn test_jsonl_skips_blank_lines_and_stops_on_garbage() {
        let file = file_with("{\"n\": 1}\n\n{\"n\": 2}\nnot json\n{\"n\": 3}\n");
        let sets = read_all(true, FileSession::local(file.path(), "nums")).await;
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].msg.data.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_writer_appends_lines_and_confirms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = JsonWriter::open(&FileTarget::Local(path.clone())).unwrap();

        let data = match json!({"b": 1, "a": "x"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let (msg, rx) = Message::new(Op::Insert, "t", data).with_confirm();
        writer.write(msg).await.unwrap();
        writer.write(Message::from_value(Op::Insert, "t", json!({"c": true}))).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(rx.await, Ok(true));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"b\":1,\"a\":\"x\"}\n{\"c\":true}\n");
    }

    #[test]
    fn test_names_follow_layout() {
        assert_eq!(Json::default().name(), "json");
        assert_eq!(Jsonl::default().name(), "jsonl");
    }

    #[test]
    fn test_configure_overlays_fields() {
        let mut config = crate::adaptor::ConfigMap::new();
        config.insert("uri".to_string(), json!("/data/films.jsonl"));
        config.insert("typeName".to_string(), json!("films"));
        let adaptor = crate::adaptor::get_adaptor("jsonl", &config).unwrap();
        assert_eq!(adaptor.name(), "jsonl");

        let exported = adaptor.to_config().unwrap();
        assert_eq!(exported.get("uri"), Some(&json!("/data/films.jsonl")));
        assert_eq!(exported.get("type_name"), Some(&json!("films")));
        assert_eq!(exported.get("timeout"), Some(&json!("30s")));
    }
}
