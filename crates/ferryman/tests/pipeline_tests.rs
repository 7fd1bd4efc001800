//! End-to-end pipeline tests against local fixtures and a mocked cluster.

#![allow(clippy::pedantic)]

use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ferryman::{Pipeline, PipelineSpec};

async fn mock_cluster(version: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "node-1",
            "version": {"number": version}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
        .mount(&server)
        .await;
    server
}

async fn bulk_lines(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/_bulk")
        .flat_map(|r| {
            String::from_utf8_lossy(&r.body)
                .lines()
                .map(|line| serde_json::from_str::<Value>(line).unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn test_jsonl_into_cluster() {
    let server = mock_cluster("7.17.9").await;
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("movies.jsonl");
    fs::write(
        &input,
        "{\"_id\": \"1\", \"title\": \"Alien\", \"rating\": 8}\n\
         {\"_id\": \"2\", \"title\": \"Heat\", \"rating\": 8}\n\
         {\"_id\": \"3\", \"title\": \"Ran\", \"rating\": 9}\n",
    )
    .unwrap();

    let yaml = format!(
        "source:\n  type: jsonl\n  config:\n    uri: {}\nsink:\n  type: elasticsearch\n  config:\n    uri: {}/films\n    bulk_requests: 2\nfunctions:\n  - name: omit\n    fields: [rating]\n",
        input.display(),
        server.uri()
    );
    let spec = PipelineSpec::from_yaml(&yaml).unwrap();
    let stats = Pipeline::new(spec)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.read, 3);
    assert_eq!(stats.written, 3);
    assert_eq!(stats.failed, 0);

    let lines = bulk_lines(&server).await;
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], json!({"index": {"_index": "films", "_id": "1"}}));
    assert_eq!(lines[1], json!({"title": "Alien"}));
    assert_eq!(lines[5], json!({"title": "Ran"}));
}

#[tokio::test]
async fn test_unreachable_cluster_fails_before_reading() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("movies.jsonl");
    fs::write(&input, "{\"title\": \"Alien\"}\n").unwrap();

    let yaml = format!(
        "source:\n  type: jsonl\n  config:\n    uri: {}\nsink:\n  type: elasticsearch\n  config:\n    uri: http://127.0.0.1:1/films\n    timeout: 2s\n",
        input.display()
    );
    let spec = PipelineSpec::from_yaml(&yaml).unwrap();
    let result = Pipeline::new(spec).unwrap().run(CancellationToken::new()).await;
    assert!(result.is_err());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_filter_into_jsonl() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("shop.db");
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db.display()))
        .await
        .unwrap();
    for statement in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
        "INSERT INTO users VALUES (1, 'ada'), (2, 'alan')",
        "CREATE TABLE audit (id INTEGER, event TEXT)",
        "INSERT INTO audit VALUES (1, 'login')",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool.close().await;

    let output = dir.path().join("out.jsonl");
    let yaml = format!(
        "source:\n  type: sqlite\n  config:\n    uri: {}\n  filter: users\nsink:\n  type: jsonl\n  config:\n    uri: {}\n",
        db.display(),
        output.display()
    );
    let spec = PipelineSpec::from_yaml(&yaml).unwrap();
    let stats = Pipeline::new(spec)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.written, 2);
    let written = fs::read_to_string(&output).unwrap();
    assert!(written.contains("ada"));
    assert!(!written.contains("login"));
}
