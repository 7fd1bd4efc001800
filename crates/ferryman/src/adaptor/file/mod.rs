//! File adaptors: CSV, JSON and JSON-lines.
//!
//! Every file adaptor resolves its URI the same way: `stdout://` writes to
//! standard output, `http://` and `https://` sources are downloaded to a
//! temporary file that is removed on close, `file://` and bare paths are
//! used as-is.

pub mod csv;
pub mod json;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::common::{check_response, create_http_client, MAX_DOWNLOAD_SIZE};
use crate::client::{Client, Session};
use crate::error::{Error, Result};

/// URI that selects standard output.
pub const STDOUT_URI: &str = "stdout://";

/// Resolved location of a file adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    /// Standard output, writers only.
    Stdout,
    /// A file on disk, possibly a downloaded copy.
    Local(PathBuf),
}

/// Open file handle shared by file readers and writers.
#[derive(Debug, Clone)]
pub struct FileSession {
    /// Where to read or write.
    pub target: FileTarget,
    /// Namespace attached to every record read from the file.
    pub type_name: String,
}

impl FileSession {
    /// Session writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            target: FileTarget::Stdout,
            type_name: String::new(),
        }
    }

    /// Session over a local file.
    pub fn local(path: impl Into<PathBuf>, type_name: impl Into<String>) -> Self {
        Self {
            target: FileTarget::Local(path.into()),
            type_name: type_name.into(),
        }
    }

    /// Path of the file, or an error for stdout sessions.
    pub fn path(&self) -> Result<&Path> {
        match &self.target {
            FileTarget::Local(path) => Ok(path),
            FileTarget::Stdout => Err(Error::Config("cannot read from stdout://".to_string())),
        }
    }

    /// Human readable location for logs.
    #[must_use]
    pub fn display(&self) -> String {
        match &self.target {
            FileTarget::Stdout => STDOUT_URI.to_string(),
            FileTarget::Local(path) => path.display().to_string(),
        }
    }
}

/// Namespace for a file: the configured type name, or the file stem.
pub(crate) fn namespace_for(uri: &str, type_name: &str) -> String {
    if !type_name.is_empty() {
        return type_name.to_string();
    }
    let name = uri.rsplit('/').next().unwrap_or(uri);
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    if stem.is_empty() {
        "file".to_string()
    } else {
        stem.to_string()
    }
}

fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

/// Client resolving a file URI into a [`FileSession`].
pub struct FileClient {
    uri: String,
    type_name: String,
    timeout: Duration,
    create_missing: bool,
    downloaded: Option<PathBuf>,
}

impl FileClient {
    /// Creates a client. With `create_missing`, connecting to a path that
    /// does not exist creates an empty file so writers can append to it.
    pub fn new(uri: &str, type_name: &str, timeout: Duration, create_missing: bool) -> Self {
        Self {
            uri: uri.to_string(),
            type_name: namespace_for(uri, type_name),
            timeout,
            create_missing,
            downloaded: None,
        }
    }

    async fn download(&self) -> Result<PathBuf> {
        let http = create_http_client(self.timeout)?;
        let response = http
            .get(&self.uri)
            .send()
            .await
            .map_err(|e| Error::Connect(format!("{}: {e}", self.uri)))?;
        let response = check_response(response, "file download").await?;
        if response.content_length().unwrap_or(0) > MAX_DOWNLOAD_SIZE {
            return Err(Error::Extraction(format!(
                "{} exceeds the {MAX_DOWNLOAD_SIZE} byte download limit",
                self.uri
            )));
        }
        let bytes = response.bytes().await?;
        if bytes.len() as u64 > MAX_DOWNLOAD_SIZE {
            return Err(Error::Extraction(format!(
                "{} exceeds the {MAX_DOWNLOAD_SIZE} byte download limit",
                self.uri
            )));
        }

        let extension = Path::new(self.uri.rsplit('/').next().unwrap_or_default())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("dat");
        let path = std::env::temp_dir().join(format!("ferryman-{}.{extension}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        info!(uri = %self.uri, path = %path.display(), "download complete");
        Ok(path)
    }
}

#[async_trait]
impl Client for FileClient {
    async fn connect(&mut self) -> Result<Session> {
        if self.uri == STDOUT_URI {
            return Ok(Session::File(FileSession {
                target: FileTarget::Stdout,
                type_name: self.type_name.clone(),
            }));
        }

        let path = if is_remote(&self.uri) {
            if self.downloaded.is_none() {
                self.downloaded = Some(self.download().await?);
            }
            self.downloaded.clone().unwrap_or_default()
        } else {
            PathBuf::from(self.uri.strip_prefix("file://").unwrap_or(&self.uri))
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::Config(format!("{} is a directory", path.display())));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.create_missing => {
                debug!(path = %path.display(), "creating missing file");
                tokio::fs::File::create(&path).await?;
            }
            Err(e) => {
                return Err(Error::Connect(format!("{}: {e}", path.display())));
            }
        }

        Ok(Session::File(FileSession {
            target: FileTarget::Local(path),
            type_name: self.type_name.clone(),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(path) = self.downloaded.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove downloaded file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_namespace_for() {
        assert_eq!(namespace_for("/data/users.csv", ""), "users");
        assert_eq!(namespace_for("file:///data/users.csv", "people"), "people");
        assert_eq!(namespace_for("https://host/export/orders.jsonl", ""), "orders");
    }

    #[tokio::test]
    async fn test_stdout_session() {
        let mut client = FileClient::new(STDOUT_URI, "out", Duration::from_secs(1), true);
        let session = client.connect().await.unwrap().into_file().unwrap();
        assert_eq!(session.target, FileTarget::Stdout);
        assert!(session.path().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_fails_for_sources() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.csv");
        let mut client = FileClient::new(missing.to_str().unwrap(), "", Duration::from_secs(1), false);
        assert!(matches!(client.connect().await, Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn test_missing_file_created_for_sinks() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.jsonl");
        let uri = format!("file://{}", target.display());
        let mut client = FileClient::new(&uri, "", Duration::from_secs(1), true);
        let session = client.connect().await.unwrap().into_file().unwrap();
        assert_eq!(session.path().unwrap(), target.as_path());
        assert_eq!(session.type_name, "out");
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_remote_file_downloaded_and_removed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/export/users.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,name\n1,ada\n"))
            .mount(&server)
            .await;

        let uri = format!("{}/export/users.csv", server.uri());
        let mut client = FileClient::new(&uri, "", Duration::from_secs(5), false);
        let session = client.connect().await.unwrap().into_file().unwrap();
        let local = session.path().unwrap().to_path_buf();
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "id,name\n1,ada\n");
        assert_eq!(session.type_name, "users");

        client.close().await.unwrap();
        assert!(!local.exists());
    }
}
