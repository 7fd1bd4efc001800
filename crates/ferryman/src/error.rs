//! Error types for ferryman.
//!
//! Every failure surfaced by an adaptor, the bulk writer, the function chain
//! or the commit log is one of these variants. Error codes follow the pattern
//! `FERRY-XXX` so log lines can be grepped across releases.

use thiserror::Error;

use crate::adaptor::Role;

/// Result type alias for ferryman operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running a pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (FERRY-001).
    #[error("[FERRY-001] Configuration error: {0}")]
    Config(String),

    /// URI could not be parsed (FERRY-002).
    #[error("[FERRY-002] Invalid URI '{0}'")]
    InvalidUri(String),

    /// Duration string could not be parsed (FERRY-003).
    #[error("[FERRY-003] Invalid timeout '{0}'")]
    InvalidTimeout(String),

    /// No adaptor registered under this name (FERRY-004).
    #[error("[FERRY-004] Adaptor '{0}' not found in registry")]
    AdaptorNotFound(String),

    /// No function registered under this name (FERRY-005).
    #[error("[FERRY-005] Function '{0}' not found in registry")]
    FunctionNotFound(String),

    /// The adaptor does not implement the requested role (FERRY-006).
    #[error("[FERRY-006] {role} is not supported by the '{adaptor}' adaptor")]
    Unsupported {
        /// Adaptor name.
        adaptor: String,
        /// Role that was requested.
        role: Role,
    },

    /// Could not reach or authenticate against a remote system (FERRY-007).
    #[error("[FERRY-007] Connection error: {0}")]
    Connect(String),

    /// Detected server version has no matching client (FERRY-008).
    #[error("[FERRY-008] Unsupported version {version} at {uri}: {reason}")]
    Version {
        /// URI that was probed.
        uri: String,
        /// Version reported by the server.
        version: String,
        /// Why no client matched.
        reason: String,
    },

    /// A reader or writer was handed a session of another adaptor family (FERRY-009).
    #[error("[FERRY-009] Session mismatch: expected {expected}, got {actual}")]
    SessionMismatch {
        /// Session kind the component needs.
        expected: &'static str,
        /// Session kind it received.
        actual: &'static str,
    },

    /// Failure while reading or decoding source records (FERRY-010).
    #[error("[FERRY-010] Extraction error: {0}")]
    Extraction(String),

    /// SQL driver error (FERRY-011).
    #[error("[FERRY-011] Database error: {0}")]
    Database(String),

    /// Redis driver error (FERRY-012).
    #[error("[FERRY-012] Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP transport error (FERRY-013).
    #[error("[FERRY-013] HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (FERRY-014).
    #[error("[FERRY-014] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (FERRY-015).
    #[error("[FERRY-015] Serialization error: {0}")]
    Serialization(String),

    /// A bulk request item was rejected by the search cluster (FERRY-016).
    #[error("[FERRY-016] Commit failed for document '{id}' in '{index}': {reason}")]
    Commit {
        /// Document id of the first failing item.
        id: String,
        /// Index of the first failing item.
        index: String,
        /// Failure reason reported by the cluster.
        reason: String,
    },

    /// Index mapping could not be applied (FERRY-017).
    #[error("[FERRY-017] Mapping error: {0}")]
    Mapping(String),

    /// Commit log could not be opened or appended (FERRY-018).
    #[error("[FERRY-018] Commit log error: {0}")]
    CommitLog(String),

    /// Commit log frame failed validation (FERRY-019).
    #[error("[FERRY-019] Corrupt commit log entry at offset {offset}: {reason}")]
    Corrupt {
        /// Offset of the damaged entry.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },

    /// A transform function failed (FERRY-020).
    #[error("[FERRY-020] Function error: {0}")]
    Function(String),

    /// Kafka client error (FERRY-021).
    #[error("[FERRY-021] Kafka error: {0}")]
    Kafka(String),

    /// Credentials were rejected (FERRY-022).
    #[error("[FERRY-022] Authentication failed: {0}")]
    Authentication(String),

    /// Remote asked us to slow down, retry after N seconds (FERRY-023).
    #[error("[FERRY-023] Rate limited, retry after {0}s")]
    RateLimit(u64),
}

impl Error {
    /// Returns the error code (e.g., "FERRY-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "FERRY-001",
            Self::InvalidUri(_) => "FERRY-002",
            Self::InvalidTimeout(_) => "FERRY-003",
            Self::AdaptorNotFound(_) => "FERRY-004",
            Self::FunctionNotFound(_) => "FERRY-005",
            Self::Unsupported { .. } => "FERRY-006",
            Self::Connect(_) => "FERRY-007",
            Self::Version { .. } => "FERRY-008",
            Self::SessionMismatch { .. } => "FERRY-009",
            Self::Extraction(_) => "FERRY-010",
            Self::Database(_) => "FERRY-011",
            Self::Redis(_) => "FERRY-012",
            Self::Http(_) => "FERRY-013",
            Self::Io(_) => "FERRY-014",
            Self::Serialization(_) => "FERRY-015",
            Self::Commit { .. } => "FERRY-016",
            Self::Mapping(_) => "FERRY-017",
            Self::CommitLog(_) => "FERRY-018",
            Self::Corrupt { .. } => "FERRY-019",
            Self::Function(_) => "FERRY-020",
            Self::Kafka(_) => "FERRY-021",
            Self::Authentication(_) => "FERRY-022",
            Self::RateLimit(_) => "FERRY-023",
        }
    }

    /// Returns true if this error must stop the whole pipeline.
    ///
    /// Mid-stream read failures only end the namespace being read and
    /// function failures only drop the message at hand.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Extraction(_)
                | Self::Database(_)
                | Self::Redis(_)
                | Self::Http(_)
                | Self::Function(_)
                | Self::Kafka(_)
                | Self::RateLimit(_)
        )
    }

    /// Returns true for configuration errors detected before any connection.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidUri(_)
                | Self::InvalidTimeout(_)
                | Self::AdaptorNotFound(_)
                | Self::FunctionNotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}
