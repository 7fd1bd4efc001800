//! Version-specific reader and writer implementations.
//!
//! Each entry pairs a semver constraint with the factories that speak that
//! cluster generation's protocol. Selection scans entries in order and takes
//! the first whose constraint holds and which implements the wanted role.

use semver::{Version, VersionReq};
use tokio_util::sync::CancellationToken;

use super::bulk::{BulkWriter, WriterOptions};
use super::reader::{ScrollReader, TypedReader, TypelessReader};
use super::EsSession;
use crate::adaptor::Role;
use crate::client::{Reader, Writer};
use crate::error::{Error, Result};

/// Builds a writer for an open session.
pub type WriterFactory =
    fn(WriterOptions, EsSession, CancellationToken) -> Result<Box<dyn Writer>>;

/// Builds a reader.
pub type ReaderFactory = fn() -> Box<dyn Reader>;

/// Protocol generation of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Indices hold named document types (2.x to 6.x).
    Typed,
    /// One implicit type per index (7.x and later).
    Typeless,
}

/// A constraint plus the factories valid under it.
#[derive(Debug, Clone, Copy)]
pub struct VersionedClient {
    /// Short name, e.g. `v7`.
    pub name: &'static str,
    /// Semver requirement, e.g. `>=7.0.0, <8.0.0`.
    pub constraint: &'static str,
    /// Protocol generation.
    pub generation: Generation,
    /// Writer factory, if this generation can be written.
    pub writer: Option<WriterFactory>,
    /// Reader factory, if this generation can be read.
    pub reader: Option<ReaderFactory>,
}

impl VersionedClient {
    /// True when `version` satisfies the constraint.
    ///
    /// Pre-release builds are matched as their release.
    pub fn matches(&self, version: &Version) -> Result<bool> {
        let req = VersionReq::parse(self.constraint).map_err(|e| {
            Error::Config(format!("bad constraint '{}' for {}: {e}", self.constraint, self.name))
        })?;
        let release = Version::new(version.major, version.minor, version.patch);
        Ok(req.matches(&release))
    }

    fn supports(&self, role: Role) -> bool {
        match role {
            Role::Writer => self.writer.is_some(),
            Role::Reader => self.reader.is_some(),
            Role::Client => true,
        }
    }
}

fn typed_writer(
    options: WriterOptions,
    session: EsSession,
    cancel: CancellationToken,
) -> Result<Box<dyn Writer>> {
    Ok(Box::new(BulkWriter::new(
        options,
        session,
        Generation::Typed,
        cancel,
    )))
}

fn typeless_writer(
    options: WriterOptions,
    session: EsSession,
    cancel: CancellationToken,
) -> Result<Box<dyn Writer>> {
    Ok(Box::new(BulkWriter::new(
        options,
        session,
        Generation::Typeless,
        cancel,
    )))
}

fn typed_reader() -> Box<dyn Reader> {
    Box::new(TypedReader)
}

fn typeless_reader() -> Box<dyn Reader> {
    Box::new(TypelessReader)
}

fn scroll_reader() -> Box<dyn Reader> {
    Box::new(ScrollReader)
}

/// Built-in clients in registration order.
pub const CLIENTS: &[VersionedClient] = &[
    VersionedClient {
        name: "v2",
        constraint: ">=2.0.0, <5.0.0",
        generation: Generation::Typed,
        writer: Some(typed_writer),
        reader: Some(typed_reader),
    },
    VersionedClient {
        name: "v5",
        constraint: ">=5.0.0, <6.0.0",
        generation: Generation::Typed,
        writer: Some(typed_writer),
        reader: Some(typed_reader),
    },
    VersionedClient {
        name: "v6",
        constraint: ">=6.0.0, <7.0.0",
        generation: Generation::Typed,
        writer: Some(typed_writer),
        reader: Some(typed_reader),
    },
    VersionedClient {
        name: "v7",
        constraint: ">=7.0.0, <8.0.0",
        generation: Generation::Typeless,
        writer: Some(typeless_writer),
        reader: Some(typeless_reader),
    },
    VersionedClient {
        name: "v8",
        constraint: ">=8.0.0",
        generation: Generation::Typeless,
        writer: Some(typeless_writer),
        reader: Some(scroll_reader),
    },
];

/// Picks the first client in `clients` that matches `version` and `role`.
///
/// # Errors
///
/// Returns [`Error::Version`] naming `uri` and `version` when none match.
pub fn select<'a>(
    clients: &'a [VersionedClient],
    version: &Version,
    role: Role,
    uri: &str,
) -> Result<&'a VersionedClient> {
    for client in clients {
        if client.supports(role) && client.matches(version)? {
            tracing::debug!(client = client.name, %version, %role, "selected versioned client");
            return Ok(client);
        }
    }
    Err(Error::Version {
        uri: uri.to_string(),
        version: version.to_string(),
        reason: format!("no {role} client matches this version"),
    })
}
