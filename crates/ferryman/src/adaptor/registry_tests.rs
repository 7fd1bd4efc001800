//! Tests for the adaptor registry.

use super::*;
use crate::adaptor::config::parse_sample;
use crate::adaptor::Configurable;
use crate::adaptor::file::FileSession;
use crate::adaptor::Role;
use crate::client::Session;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[test]
fn test_every_builtin_builds_from_empty_config() {
    let registry = Registry::with_builtin();
    for name in registry.names() {
        let adaptor = registry
            .get_adaptor(&name, &ConfigMap::new())
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(adaptor.name(), name);
        assert!(!adaptor.description().is_empty());
        assert!(adaptor.roles().contains(&Role::Client));
    }
}

#[test]
fn test_every_sample_config_round_trips() {
    let registry = Registry::with_builtin();
    for adaptor in registry.defaults() {
        let sample = parse_sample(adaptor.sample_config())
            .unwrap_or_else(|e| panic!("{}: {e}", adaptor.name()));
        let configured = registry
            .get_adaptor(adaptor.name(), &sample)
            .unwrap_or_else(|e| panic!("{}: {e}", adaptor.name()));

        let exported = configured.to_config().unwrap();
        for (key, value) in &sample {
            assert_eq!(exported.get(key), Some(value), "{}: {key}", adaptor.name());
        }
    }
}

#[test]
fn test_builtin_names_are_sorted() {
    let names = Registry::with_builtin().names();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    for expected in ["csv", "elasticsearch", "firestore", "json", "jsonl", "mongodb", "redis"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
}

#[test]
fn test_unknown_adaptor() {
    let registry = Registry::with_builtin();
    let err = registry
        .get_adaptor("rethinkdb", &ConfigMap::new())
        .err()
        .unwrap();
    assert!(matches!(err, Error::AdaptorNotFound(ref name) if name == "rethinkdb"));
    assert!(err.is_config());
}

#[test]
fn test_register_replaces_previous_factory() {
    let registry = Registry::new();
    registry.register("files", super::super::file::csv::factory);
    registry.register("files", super::super::file::json::jsonl_factory);

    let adaptor = registry.get_adaptor("files", &ConfigMap::new()).unwrap();
    assert_eq!(adaptor.name(), "jsonl");
    assert_eq!(registry.names(), vec!["files".to_string()]);
}

#[test]
fn test_config_is_decoded_onto_defaults() {
    let registry = Registry::with_builtin();
    let mut config = ConfigMap::new();
    config.insert("uri".to_string(), json!("/data/users.csv"));
    config.insert("typeName".to_string(), json!("users"));

    let adaptor = registry.get_adaptor("csv", &config).unwrap();
    let exported = adaptor.to_config().unwrap();
    assert_eq!(exported.get("uri"), Some(&json!("/data/users.csv")));
    assert_eq!(exported.get("type_name"), Some(&json!("users")));
    assert_eq!(exported.get("timeout"), Some(&json!("30s")));
}

#[test]
fn test_bad_config_value_is_a_config_error() {
    let registry = Registry::with_builtin();
    let mut config = ConfigMap::new();
    config.insert("bulk_requests".to_string(), json!("many"));
    let err = registry
        .get_adaptor("elasticsearch", &config)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_source_only_adaptor_has_no_writer() {
    let adaptor = Registry::with_builtin()
        .get_adaptor("csv", &ConfigMap::new())
        .unwrap();
    let err = adaptor
        .writer(Session::File(FileSession::stdout()), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Unsupported { ref adaptor, role: Role::Writer } if adaptor == "csv"
    ));
}

#[test]
fn test_global_registry_lookup() {
    assert!(registered_adaptors().contains(&"elasticsearch".to_string()));
    assert!(get_adaptor("jsonl", &ConfigMap::new()).is_ok());
}
