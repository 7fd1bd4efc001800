//! CSV source.
//!
//! The first row holds column names. Every following row becomes one
//! insert message keyed by those names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{FileClient, FileSession};
use crate::adaptor::common::cast_str;
use crate::adaptor::config::{parse_duration, DEFAULT_TIMEOUT};
use crate::adaptor::{Adaptor, Role, SOURCE_ROLES};
use crate::client::{channel, emit, read_fn, Client, NamespaceFilter, ReadFn, Reader, Session};
use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageSet, Op};
use crate::pipeline::resume::ResumeMap;

const DESCRIPTION: &str = "a csv source adaptor";

const SAMPLE_CONFIG: &str = r#"{
  "uri": "/path/to/file.csv",
  "type_name": "csvType" // namespace for every row, defaults to the file name
  // "delimiter": ",",
  // "infer_types": false // turn numeric and boolean cells into JSON values
}"#;

/// CSV adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Csv {
    /// Local path, `file://` URI or http(s) URL.
    pub uri: String,
    /// Download timeout for remote files.
    pub timeout: String,
    /// Namespace for every row.
    pub type_name: String,
    /// Field delimiter.
    pub delimiter: char,
    /// Cast numeric and boolean cells instead of keeping strings.
    pub infer_types: bool,
}

impl Default for Csv {
    fn default() -> Self {
        Self {
            uri: String::new(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            type_name: String::new(),
            delimiter: ',',
            infer_types: false,
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Csv::default())
}

#[async_trait]
impl Adaptor for Csv {
    fn name(&self) -> &'static str {
        "csv"
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
        if self.uri.is_empty() {
            return Err(Error::Config("csv adaptor requires a uri".to_string()));
        }
        Ok(Box::new(FileClient::new(
            &self.uri,
            &self.type_name,
            parse_duration(&self.timeout)?,
            false,
        )))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        let delimiter = u8::try_from(self.delimiter).map_err(|_| {
            Error::Config(format!("csv delimiter must be ASCII, got '{}'", self.delimiter))
        })?;
        Ok(Box::new(CsvReader {
            delimiter,
            infer_types: self.infer_types,
        }))
    }
}

/// Streams rows of a CSV file.
pub struct CsvReader {
    delimiter: u8,
    infer_types: bool,
}

impl Reader for CsvReader {
    fn read(&self, _resume: ResumeMap, filter: NamespaceFilter) -> ReadFn {
        let delimiter = self.delimiter;
        let infer_types = self.infer_types;
        read_fn(move |session: Session, cancel: CancellationToken| async move {
            let file = session.into_file()?;
            let path = file.path()?.to_path_buf();
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .from_path(&path)
                .map_err(|e| Error::Extraction(format!("{}: {e}", file.display())))?;
            let (tx, rx) = channel();

            tokio::spawn(async move {
                let FileSession { type_name, .. } = file;
                if !filter.matches(&type_name) {
                    info!(type_name = %type_name, "file excluded by namespace filter");
                    return;
                }
                info!(file = %path.display(), type_name = %type_name, "reading file");

                let headers = match reader.headers() {
                    Ok(headers) => headers.clone(),
                    Err(e) => {
                        error!(file = %path.display(), error = %e, "cannot read csv header");
                        return;
                    }
                };

                let mut rows = 0u64;
                for record in reader.records() {
                    if cancel.is_cancelled() {
                        info!(file = %path.display(), "read cancelled");
                        return;
                    }
                    let record = match record {
                        Ok(record) => record,
                        Err(e) => {
                            error!(file = %path.display(), row = rows + 1, error = %e, "error reading csv row");
                            return;
                        }
                    };
                    let data = row_to_data(&headers, &record, infer_types);
                    let set = MessageSet::new(Message::new(Op::Insert, type_name.as_str(), data));
                    if !emit(&tx, &cancel, set).await {
                        return;
                    }
                    rows += 1;
                }
                info!(file = %path.display(), type_name = %type_name, rows, "read complete");
            });

            Ok(rx)
        })
    }
}

fn row_to_data(headers: &csv::StringRecord, record: &csv::StringRecord, infer_types: bool) -> Data {
    headers
        .iter()
        .zip(record.iter())
        .map(|(column, cell)| {
            let value = if infer_types {
                cast_str(cell)
            } else {
                Value::String(cell.to_string())
            };
            (column.to_string(), value)
        })
        .collect()
}
