// Migration engine - pedantic lints relaxed for adaptor ergonomics
#![allow(clippy::pedantic)]

//! # Ferryman
//!
//! `ferryman` moves records between databases, files, queues and search
//! clusters. Sources and sinks are pluggable [adaptors](adaptor), records can
//! be reshaped by a chain of [functions](function) on the way, and records
//! from continuous sources are kept in a [commit log](commitlog) until the
//! sink confirms them.
//!
//! ## Supported Adaptors
//!
//! | Adaptor | Source | Sink | Notes |
//! |---------|--------|------|-------|
//! | Elasticsearch | ✅ | ✅ | 1.x to 7.x, OpenSearch |
//! | PostgreSQL | ✅ | ❌ | Change tailing via logical replication |
//! | MySQL | ✅ | ❌ | Requires `mysql` feature |
//! | SQLite | ✅ | ❌ | Requires `sqlite` feature |
//! | Redis | ✅ | ❌ | |
//! | CSV / JSON / JSONL | ✅ | JSON only | Local, remote or stdout |
//! | Firestore | ✅ | ❌ | REST API |
//! | Kafka | ✅ | ✅ | Requires `kafka` feature |
//! | MongoDB | ❌ | ✅ | Atlas Data API |
//! | SQL Server | ✅ | ❌ | Requires `mssql` feature |
//!
//! ## Quick Start
//!
//! ```bash
//! # Copy a Postgres database into the local cluster's `shop` index
//! ferryman import --src.type postgres --src.uri postgres://localhost/shop shop
//!
//! # Run a pipeline file
//! ferryman run pipeline.yaml
//! ```
//!
//! ## Pipeline Example
//!
//! ```yaml
//! source:
//!   type: mysql
//!   config:
//!     uri: mysql://root@localhost:3306/shop
//! sink:
//!   type: elasticsearch
//!   config:
//!     uri: http://localhost:9200/shop
//!     bulk_requests: 500
//! functions:
//!   - name: omit
//!     fields: [password]
//! ```

#![warn(missing_docs)]

pub mod adaptor;
pub mod client;
pub mod commitlog;
pub mod config;
pub mod error;
pub mod function;
pub mod message;
pub mod pipeline;
pub mod retry;

pub use adaptor::{get_adaptor, register, registered_adaptors, Adaptor, ConfigMap, Role};
pub use client::{Client, NamespaceFilter, Reader, Session, Writer};
pub use commitlog::CommitLog;
pub use config::ImportConfig;
pub use error::{Error, Result};
pub use function::{Chain, Function, FunctionSpec};
pub use message::{Message, MessageSet, Mode, Op};
pub use pipeline::{Pipeline, PipelineSpec, PipelineStats};
