//! Import configuration file.
//!
//! `ferryman import --config ferryman.toml` reads a fixed set of keys:
//!
//! ```toml
//! [src]
//! type = "postgres"
//! uri = "postgres://127.0.0.1:5432/shop"
//! tail = true
//! replication_slot = "ferryman"
//! filter = "public\\..*"
//! transform_file = "transforms.yaml"
//! log_dir = "/var/lib/ferryman"
//!
//! [dest]
//! uri = "http://localhost:9200/shop"
//! bulk_requests = 500
//! ```
//!
//! # Priority (highest to lowest)
//!
//! 1. Command-line flags
//! 2. Environment variables (`FERRYMAN_SRC__URI`, `FERRYMAN_DEST__TAIL`, ...)
//! 3. Configuration file
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::adaptor::ConfigMap;
use crate::commitlog::DEFAULT_MAX_SEGMENT_BYTES;
use crate::error::{Error, Result};
use crate::function::FunctionSpec;
use crate::pipeline::{CommitLogSpec, PipelineSpec, SinkSpec, SourceSpec};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FERRYMAN_";

/// Cluster assumed when the destination is a bare index name.
pub const DEFAULT_CLUSTER: &str = "http://localhost:9200";

/// `[src]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source adaptor name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Source URI.
    pub uri: String,
    /// Keep following changes after the initial copy.
    pub tail: bool,
    /// Require TLS when connecting.
    pub ssl: bool,
    /// Logical replication slot for tailing.
    pub replication_slot: String,
    /// Namespace regex.
    pub filter: String,
    /// YAML list of functions applied to every record.
    pub transform_file: Option<PathBuf>,
    /// Commit log directory; no commit log when unset.
    pub log_dir: Option<PathBuf>,
    /// Namespace for file sources.
    pub type_name: String,
    /// Connection timeout (`30s`, `500ms`, ...).
    pub timeout: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: "postgres".to_string(),
            uri: String::new(),
            tail: false,
            ssl: false,
            replication_slot: String::new(),
            filter: ".*".to_string(),
            transform_file: None,
            log_dir: None,
            type_name: String::new(),
            timeout: String::new(),
        }
    }
}

/// `[dest]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestConfig {
    /// Sink adaptor name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Full URL or bare index name.
    pub uri: String,
    /// Sink side of a tailing import.
    pub tail: bool,
    /// Bulk request size limit in bytes.
    pub request_size: Option<usize>,
    /// Bulk actions per request.
    pub bulk_requests: Option<usize>,
}

impl Default for DestConfig {
    fn default() -> Self {
        Self {
            kind: "elasticsearch".to_string(),
            uri: String::new(),
            tail: false,
            request_size: None,
            bulk_requests: None,
        }
    }
}

/// Complete import configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Source settings.
    pub src: SourceConfig,
    /// Destination settings.
    pub dest: DestConfig,
}

impl ImportConfig {
    fn figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(format!("invalid import configuration: {e}")))
    }

    /// Loads defaults and environment overrides, plus `path` when given.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the file is missing or malformed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "configuration file not found: {}",
                        path.display()
                    )));
                }
                Self::figment().merge(Toml::file(path))
            }
            None => Self::figment(),
        };
        Self::extract(figment)
    }

    /// Parses a TOML string on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on malformed input.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Self::figment()
            .merge(Toml::string(toml_str))
            .extract()
            .map_err(|e| Error::Config(format!("invalid import configuration: {e}")))
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Builds the pipeline this configuration describes.
    ///
    /// # Errors
    ///
    /// A missing source URI or destination, or an unreadable transform file.
    pub fn to_pipeline_spec(&self) -> Result<PipelineSpec> {
        if self.src.uri.is_empty() {
            return Err(Error::Config("src.uri is required".to_string()));
        }
        if self.dest.uri.is_empty() {
            return Err(Error::Config("a destination is required".to_string()));
        }

        let mut source = ConfigMap::new();
        source.insert("uri".to_string(), Value::from(self.src.uri.clone()));
        source.insert("tail".to_string(), Value::from(self.src.tail));
        if self.src.ssl {
            source.insert("ssl".to_string(), Value::from(true));
        }
        insert_non_empty(&mut source, "replication_slot", &self.src.replication_slot);
        insert_non_empty(&mut source, "type_name", &self.src.type_name);
        insert_non_empty(&mut source, "timeout", &self.src.timeout);

        let mut sink = ConfigMap::new();
        sink.insert("uri".to_string(), Value::from(resolve_destination(&self.dest.uri)));
        sink.insert("tail".to_string(), Value::from(self.dest.tail || self.src.tail));
        if let Some(size) = self.dest.request_size {
            sink.insert("request_size".to_string(), Value::from(size));
        }
        if let Some(count) = self.dest.bulk_requests {
            sink.insert("bulk_requests".to_string(), Value::from(count));
        }

        let functions = match &self.src.transform_file {
            Some(path) => load_transform_file(path)?,
            None => Vec::new(),
        };
        let filter = (!self.src.filter.is_empty() && self.src.filter != ".*")
            .then(|| self.src.filter.clone());

        Ok(PipelineSpec {
            source: SourceSpec {
                kind: self.src.kind.clone(),
                config: source,
                filter,
            },
            sink: SinkSpec {
                kind: self.dest.kind.clone(),
                config: sink,
            },
            functions,
            commit_log: self.src.log_dir.as_ref().map(|dir| CommitLogSpec {
                dir: dir.clone(),
                max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            }),
        })
    }
}

fn insert_non_empty(config: &mut ConfigMap, key: &str, value: &str) {
    if !value.is_empty() {
        config.insert(key.to_string(), Value::from(value));
    }
}

/// Expands a bare index name into a URL on the local cluster.
#[must_use]
pub fn resolve_destination(dest: &str) -> String {
    if dest.contains("://") {
        dest.to_string()
    } else {
        format!("{DEFAULT_CLUSTER}/{}", dest.trim_start_matches('/'))
    }
}

/// Reads a YAML list of function specs.
///
/// # Errors
///
/// Returns `Error::Config` when the file cannot be read or parsed.
pub fn load_transform_file(path: &Path) -> Result<Vec<FunctionSpec>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read transform file {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!("invalid transform file {}: {e}", path.display()))
    })
}
