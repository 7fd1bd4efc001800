//! Name → factory lookup for adaptors.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

use super::config::ConfigMap;
use super::Adaptor;
use crate::error::{Error, Result};

/// Zero-argument constructor yielding an adaptor with default settings.
pub type Factory = fn() -> Box<dyn Adaptor>;

/// Adaptor registry.
///
/// Registering a name twice replaces the earlier factory.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in adaptor.
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register("elasticsearch", super::elasticsearch::factory);
        registry.register("redis", super::redis::factory);
        registry.register("csv", super::file::csv::factory);
        registry.register("json", super::file::json::json_factory);
        registry.register("jsonl", super::file::json::jsonl_factory);
        registry.register("firestore", super::firestore::factory);
        registry.register("mongodb", super::mongodb::factory);
        #[cfg(feature = "postgres")]
        registry.register("postgres", super::sql::postgres_factory);
        #[cfg(feature = "mysql")]
        registry.register("mysql", super::sql::mysql_factory);
        #[cfg(feature = "sqlite")]
        registry.register("sqlite", super::sql::sqlite_factory);
        #[cfg(feature = "kafka")]
        registry.register("kafka", super::kafka::factory);
        #[cfg(feature = "mssql")]
        registry.register("mssql", super::mssql::factory);
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&self, name: &str, factory: Factory) {
        let replaced = self
            .factories
            .write()
            .insert(name.to_string(), factory)
            .is_some();
        if replaced {
            debug!(adaptor = name, "replaced registered adaptor factory");
        }
    }

    /// Instantiates `name` and decodes `config` onto it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdaptorNotFound`] for unknown names and
    /// [`Error::Config`] when the map does not decode.
    pub fn get_adaptor(&self, name: &str, config: &ConfigMap) -> Result<Box<dyn Adaptor>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| Error::AdaptorNotFound(name.to_string()))?;
        let mut adaptor = factory();
        adaptor.configure(config)?;
        Ok(adaptor)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Default instance of every registered adaptor, sorted by name.
    #[must_use]
    pub fn defaults(&self) -> Vec<Box<dyn Adaptor>> {
        let factories = self.factories.read();
        let mut entries: Vec<(&String, &Factory)> = factories.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, factory)| factory()).collect()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Process-wide registry, pre-populated with the built-in adaptors.
pub fn registry() -> &'static Registry {
    GLOBAL.get_or_init(Registry::with_builtin)
}

/// Registers an adaptor in the process-wide registry.
pub fn register(name: &str, factory: Factory) {
    registry().register(name, factory);
}

/// Looks up an adaptor in the process-wide registry.
///
/// # Errors
///
/// See [`Registry::get_adaptor`].
pub fn get_adaptor(name: &str, config: &ConfigMap) -> Result<Box<dyn Adaptor>> {
    registry().get_adaptor(name, config)
}

/// Names in the process-wide registry, sorted.
pub fn registered_adaptors() -> Vec<String> {
    registry().names()
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
