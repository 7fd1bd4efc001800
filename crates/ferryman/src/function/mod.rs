//! Transforms applied to messages between the reader and the writer.
//!
//! Functions are registered by name, like adaptors, and configured from a
//! flat map decoded onto their fields. A pipeline strings them together in
//! a [`Chain`].
//!
//! ```yaml
//! - name: omit
//!   fields: [password]
//! - name: pretty
//!   spaces: 4
//! ```

mod omit;
mod pick;
mod pretty;

pub use omit::Omit;
pub use pick::Pick;
pub use pretty::Pretty;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

use crate::adaptor::{ConfigMap, Configurable};
use crate::error::{Error, Result};
use crate::message::Message;

/// A message transform.
pub trait Function: Configurable + Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Transforms one message. The confirm signal must travel with the
    /// returned message.
    fn apply(&self, msg: Message) -> Result<Message>;
}

/// Zero-argument constructor yielding a function with default settings.
pub type FunctionFactory = fn() -> Box<dyn Function>;

/// Function registry. Registering a name twice replaces the earlier entry.
#[derive(Default)]
pub struct FunctionRegistry {
    factories: RwLock<HashMap<String, FunctionFactory>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `pick`, `omit` and `pretty`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register("pick", pick::factory);
        registry.register("omit", omit::factory);
        registry.register("pretty", pretty::factory);
        registry
    }

    /// Registers `factory` under `name`.
    pub fn register(&self, name: &str, factory: FunctionFactory) {
        if self
            .factories
            .write()
            .insert(name.to_string(), factory)
            .is_some()
        {
            debug!(function = name, "replaced registered function factory");
        }
    }

    /// Instantiates `name` and decodes `config` onto it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FunctionNotFound`] for unknown names and
    /// [`Error::Config`] when the map does not decode.
    pub fn get_function(&self, name: &str, config: &ConfigMap) -> Result<Box<dyn Function>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        let mut function = factory();
        function.configure(config)?;
        Ok(function)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

static GLOBAL: OnceLock<FunctionRegistry> = OnceLock::new();

/// Process-wide function registry.
pub fn function_registry() -> &'static FunctionRegistry {
    GLOBAL.get_or_init(FunctionRegistry::with_builtin)
}

/// Looks up a function in the process-wide registry.
///
/// # Errors
///
/// See [`FunctionRegistry::get_function`].
pub fn get_function(name: &str, config: &ConfigMap) -> Result<Box<dyn Function>> {
    function_registry().get_function(name, config)
}

/// One entry of a transform file: the function name plus its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Registered function name.
    pub name: String,
    /// Remaining keys, decoded onto the function.
    #[serde(flatten)]
    pub config: ConfigMap,
}

/// Ordered list of functions; each sees the previous one's output.
#[derive(Default)]
pub struct Chain {
    functions: Vec<Box<dyn Function>>,
}

impl Chain {
    /// Wraps already built functions.
    #[must_use]
    pub fn new(functions: Vec<Box<dyn Function>>) -> Self {
        Self { functions }
    }

    /// Builds every function of `specs` from the process-wide registry.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown or misconfigured function.
    pub fn from_specs(specs: &[FunctionSpec]) -> Result<Self> {
        specs
            .iter()
            .map(|spec| get_function(&spec.name, &spec.config))
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    /// Number of functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when the chain leaves messages untouched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Runs `msg` through every function in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing function and returns an
    /// [`Error::Function`] naming it. The message is dropped, which reports
    /// its confirm signal as abandoned.
    pub fn apply(&self, mut msg: Message) -> Result<Message> {
        for function in &self.functions {
            msg = function
                .apply(msg)
                .map_err(|e| Error::Function(format!("{}: {e}", function.name())))?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Data, Op};
    use serde_json::{json, Value};

    fn data(value: Value) -> Data {
        match value {
            Value::Object(map) => map,
            _ => Data::new(),
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Failing {}

    impl Function for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn apply(&self, _msg: Message) -> Result<Message> {
            Err(Error::Extraction("boom".to_string()))
        }
    }

    #[test]
    fn test_builtin_functions() {
        let registry = FunctionRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["omit", "pick", "pretty"]);
        for name in registry.names() {
            let function = registry.get_function(&name, &ConfigMap::new()).unwrap();
            assert_eq!(function.name(), name);
        }
    }

    #[test]
    fn test_unknown_function() {
        let err = get_function("goja", &ConfigMap::new()).err().unwrap();
        assert!(matches!(err, Error::FunctionNotFound(ref n) if n == "goja"));
    }

    #[test]
    fn test_function_spec_from_yaml() {
        let specs: Vec<FunctionSpec> =
            serde_yaml::from_str("- name: pick\n  fields: [a, b]\n- name: pretty\n").unwrap();
        assert_eq!(specs[0].name, "pick");
        assert_eq!(specs[0].config.get("fields"), Some(&json!(["a", "b"])));
        assert!(specs[1].config.is_empty());
    }

    #[test]
    fn test_chain_applies_in_order() {
        let specs: Vec<FunctionSpec> = serde_yaml::from_str(
            "- name: pick\n  fields: [a, b, secret]\n- name: omit\n  fields: [secret]\n",
        )
        .unwrap();
        let chain = Chain::from_specs(&specs).unwrap();
        assert_eq!(chain.len(), 2);

        let msg = Message::new(
            Op::Update,
            "users",
            data(json!({"a": 1, "b": 2, "c": 3, "secret": "x"})),
        );
        let out = chain.apply(msg).unwrap();
        assert_eq!(out.op, Op::Update);
        assert_eq!(out.namespace, "users");
        assert_eq!(Value::Object(out.data), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_chain_error_short_circuits() {
        let chain = Chain::new(vec![
            Box::new(Failing {}),
            get_function("pretty", &ConfigMap::new()).unwrap(),
        ]);
        let (msg, rx) = Message::new(Op::Insert, "t", Data::new()).with_confirm();
        let err = chain.apply(msg).err().unwrap();
        assert!(matches!(err, Error::Function(ref m) if m.starts_with("failing:")));
        assert_eq!(tokio_test::block_on(rx), Ok(false));
    }

    #[test]
    fn test_empty_chain_is_passthrough() {
        let chain = Chain::default();
        assert!(chain.is_empty());
        let out = chain
            .apply(Message::new(Op::Delete, "t", data(json!({"k": true}))))
            .unwrap();
        assert_eq!(out.data.get("k"), Some(&json!(true)));
    }
}
