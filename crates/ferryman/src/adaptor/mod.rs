//! Adaptors for every supported source and sink.
//!
//! An adaptor is a named, configurable bundle of up to three roles: a
//! [`Client`] that opens sessions, a [`Reader`] that streams records out of
//! a session, and a [`Writer`] that pushes records into one.
//!
//! | Adaptor | Reader | Writer | Notes |
//! |---------|--------|--------|-------|
//! | `elasticsearch` | ✅ | ✅ | Version-aware, OpenSearch compatible |
//! | `postgres` | ✅ | ❌ | Tails logical replication slots |
//! | `mysql` | ✅ | ❌ | |
//! | `sqlite` | ✅ | ❌ | |
//! | `redis` | ✅ | ❌ | SCAN based |
//! | `csv` | ✅ | ❌ | Local path or http(s) URL |
//! | `json` | ✅ | ✅ | Array or object documents |
//! | `jsonl` | ✅ | ✅ | One document per line |
//! | `firestore` | ✅ | ❌ | REST API |
//! | `kafka` | ✅ | ✅ | Requires the `kafka` feature |
//! | `mongodb` | ❌ | ✅ | Atlas Data API |
//! | `mssql` | ✅ | ❌ | Requires the `mssql` feature |

pub mod common;
pub mod config;
pub mod elasticsearch;
pub mod file;
pub mod firestore;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mongodb;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod redis;
mod registry;
#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
pub mod sql;

pub use config::{ConfigMap, Configurable};
pub use registry::{get_adaptor, register, registered_adaptors, registry, Factory, Registry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, Reader, Session, Writer};
use crate::error::{Error, Result};

/// Capability an adaptor may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Opens and closes sessions.
    Client,
    /// Streams records out.
    Reader,
    /// Pushes records in.
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Client => "client",
            Self::Reader => "reader",
            Self::Writer => "writer",
        };
        f.write_str(name)
    }
}

/// A registered source or sink type.
///
/// Only [`Adaptor::client`] is mandatory. The reader and writer
/// constructors default to [`Error::Unsupported`].
#[async_trait]
pub trait Adaptor: Configurable + Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// One-line human description.
    fn description(&self) -> &'static str;

    /// Example configuration in commented JSON.
    fn sample_config(&self) -> &'static str;

    /// Roles this adaptor implements.
    fn roles(&self) -> &'static [Role];

    /// Builds a client for the configured endpoint.
    fn client(&self) -> Result<Box<dyn Client>>;

    /// Builds a reader.
    fn reader(&self) -> Result<Box<dyn Reader>> {
        Err(unsupported(self.name(), Role::Reader))
    }

    /// Builds a writer bound to an open session.
    ///
    /// Writers that hit an unrecoverable sink error raise `cancel` so the
    /// pipeline can stop its reader.
    fn writer(&self, session: Session, cancel: CancellationToken) -> Result<Box<dyn Writer>> {
        let _ = (session, cancel);
        Err(unsupported(self.name(), Role::Writer))
    }

    /// Dry run: connect and immediately disconnect.
    ///
    /// The connection is released whether or not connecting succeeded.
    async fn verify(&self) -> Result<()> {
        let mut client = self.client()?;
        let connected = client.connect().await;
        let closed = client.close().await;
        connected?;
        closed
    }
}

/// Builds the capability error for a missing role.
pub(crate) fn unsupported(adaptor: &str, role: Role) -> Error {
    Error::Unsupported {
        adaptor: adaptor.to_string(),
        role,
    }
}

/// Role list for read-only adaptors.
pub(crate) const SOURCE_ROLES: &[Role] = &[Role::Client, Role::Reader];

/// Role list for write-only adaptors.
pub(crate) const SINK_ROLES: &[Role] = &[Role::Client, Role::Writer];

/// Role list for adaptors that read and write.
pub(crate) const ALL_ROLES: &[Role] = &[Role::Client, Role::Reader, Role::Writer];
