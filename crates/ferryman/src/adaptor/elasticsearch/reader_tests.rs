//! Tests for the Elasticsearch readers.

use super::*;
use crate::adaptor::elasticsearch::uri::ClusterUri;
use semver::Version;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session(server: &MockServer, suffix: &str, version: Version) -> Session {
    Session::Elasticsearch(EsSession {
        http: reqwest::Client::new(),
        target: ClusterUri::parse(&format!("{}{suffix}", server.uri())).unwrap(),
        version,
    })
}

async fn collect(mut stream: crate::client::MessageStream) -> Vec<MessageSet> {
    let mut out = Vec::new();
    while let Some(set) = stream.recv().await {
        out.push(set);
    }
    out
}

async fn mount_typeless_cluster(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "movies": {"mappings": {}},
            "books": {"mappings": {}},
            ".kibana": {"mappings": {}}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/movies/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"hits": [
                {"_id": "1", "_source": {"title": "Alien"}, "sort": ["1"]},
                {"_id": "2", "_source": {"title": "Heat"}, "sort": ["2"]}
            ]}
        })))
        .mount(server)
        .await;
}

#[test]
fn test_list_indices_skips_system_indices() {
    let mapping = json!({"b": {}, "a": {}, ".security": {}});
    let Value::Object(map) = mapping else { unreachable!() };
    assert_eq!(list_indices(&map), vec!["a", "b"]);
}

#[test]
fn test_list_types_skips_default_mapping() {
    let mapping = json!({"lib": {"mappings": {"_default_": {}, "book": {}, "author": {}}}});
    let Value::Object(map) = mapping else { unreachable!() };
    let types = list_types(&map);
    assert_eq!(types.len(), 2);
    assert!(types.contains(&("lib".to_string(), "book".to_string())));
}

#[tokio::test]
async fn test_typeless_reader_reads_included_indices_only() {
    let server = MockServer::start().await;
    mount_typeless_cluster(&server).await;

    let read = TypelessReader.read(
        ResumeMap::new(),
        NamespaceFilter::from_regex("movies").unwrap(),
    );
    let stream = read(
        session(&server, "", Version::new(7, 10, 2)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let sets = collect(stream).await;

    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.msg.namespace == "movies"));
    assert_eq!(sets[0].msg.id(), Some("1".to_string()));
    assert_eq!(sets[1].msg.data.get("title"), Some(&json!("Heat")));
}

#[tokio::test]
async fn test_versioned_reader_dispatches_on_version() {
    let server = MockServer::start().await;
    mount_typeless_cluster(&server).await;

    let read = VersionedReader.read(
        ResumeMap::new(),
        NamespaceFilter::from_regex("movies").unwrap(),
    );
    let stream = read(
        session(&server, "", Version::new(8, 11, 0)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(collect(stream).await.len(), 2);
}

#[tokio::test]
async fn test_versioned_reader_rejects_unknown_version() {
    let server = MockServer::start().await;
    let read = VersionedReader.read(ResumeMap::new(), NamespaceFilter::all());
    let err = read(
        session(&server, "", Version::new(1, 7, 0)),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Version { .. }));
}

#[tokio::test]
async fn test_typeless_reader_emits_nothing_once_cancelled() {
    let server = MockServer::start().await;
    mount_typeless_cluster(&server).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let read = TypelessReader.read(ResumeMap::new(), NamespaceFilter::all());
    let stream = read(session(&server, "", Version::new(7, 0, 0)), cancel)
        .await
        .unwrap();
    assert!(collect(stream).await.is_empty());
}

#[tokio::test]
async fn test_typeless_reader_continues_after_namespace_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "broken": {"mappings": {}},
            "good": {"mappings": {}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken/_search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/good/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"hits": [{"_id": "g1", "_source": {"ok": true}, "sort": ["g1"]}]}
        })))
        .mount(&server)
        .await;

    let read = TypelessReader.read(ResumeMap::new(), NamespaceFilter::all());
    let stream = read(
        session(&server, "", Version::new(7, 5, 0)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let sets = collect(stream).await;
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].msg.namespace, "good");
}

#[tokio::test]
async fn test_typed_reader_scrolls_types() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/library/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "library": {"mappings": {"book": {}, "author": {}}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/library/book/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-1",
            "hits": {"hits": [
                {"_id": "b1", "_source": {"title": "Dune"}},
                {"_id": "b2", "_source": {"title": "Emma"}}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-1",
            "hits": {"hits": []}
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
        .mount(&server)
        .await;

    let read = TypedReader.read(
        ResumeMap::new(),
        NamespaceFilter::from_regex("book").unwrap(),
    );
    let stream = read(
        session(&server, "/library", Version::new(6, 8, 0)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let sets = collect(stream).await;

    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.msg.namespace == "book"));
    assert_eq!(sets[0].msg.id(), Some("b1".to_string()));
}

#[tokio::test]
async fn test_v8_indices_are_scrolled_in_doc_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"movies": {"mappings": {}}})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/movies/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-8",
            "hits": {"hits": [
                {"_id": "1", "_source": {"title": "Alien"}},
                {"_id": "2", "_source": {"title": "Heat"}}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-8",
            "hits": {"hits": [{"_id": "3", "_source": {"title": "Ran"}}]}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-8",
            "hits": {"hits": []}
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
        .expect(1)
        .mount(&server)
        .await;

    let read = VersionedReader.read(ResumeMap::new(), NamespaceFilter::all());
    let stream = read(
        session(&server, "", Version::new(8, 11, 0)),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let sets = collect(stream).await;
    assert_eq!(sets.len(), 3);
    assert_eq!(sets[2].msg.data.get("title"), Some(&json!("Ran")));

    let requests = server.received_requests().await.unwrap();
    let search = requests
        .iter()
        .find(|r| r.url.path() == "/movies/_search")
        .unwrap();
    assert_eq!(search.url.query(), Some("scroll=1m"));
    let body: Value = serde_json::from_slice(&search.body).unwrap();
    assert_eq!(body["sort"], json!(["_doc"]));
}
