//! Server version detection.

use reqwest::Client;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::uri::{redact, ClusterUri};
use crate::error::{Error, Result};

/// Version reported for OpenSearch clusters, which speak the 8.x protocol.
pub const OPENSEARCH_COMPAT_VERSION: &str = "8.8.1";

#[derive(Debug, Deserialize)]
struct RootInfo {
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    tagline: String,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    number: String,
}

/// Probes the first host of `target` and returns its version.
///
/// Transport failures, non-200 answers, malformed JSON and missing version
/// fields are all errors; no default version is assumed.
pub async fn detect(http: &Client, target: &ClusterUri) -> Result<Version> {
    let raw = if target.is_hosted() {
        probe_hosted(http, target).await?
    } else {
        probe_root(http, target).await?
    };
    let version = parse_lenient(&raw).map_err(|reason| Error::Version {
        uri: target.primary().to_string(),
        version: raw.clone(),
        reason,
    })?;
    info!(uri = %redact(target.primary()), version = %version, "detected cluster version");
    Ok(version)
}

async fn probe_root(http: &Client, target: &ClusterUri) -> Result<String> {
    let url = format!("{}/", target.primary());
    let body = fetch(http, target, &url).await?;
    let info: RootInfo = serde_json::from_str(&body).map_err(|_| Error::Version {
        uri: url.clone(),
        version: String::new(),
        reason: format!("malformed JSON: {body}"),
    })?;

    let number = info.version.map(|v| v.number).unwrap_or_default();
    if number.is_empty() {
        return Err(Error::Version {
            uri: url,
            version: String::new(),
            reason: format!("missing version: {body}"),
        });
    }

    if info.tagline.to_lowercase().contains("opensearch") {
        debug!(reported = %number, "OpenSearch detected, using 8.x compatibility");
        return Ok(OPENSEARCH_COMPAT_VERSION.to_string());
    }
    Ok(number)
}

async fn probe_hosted(http: &Client, target: &ClusterUri) -> Result<String> {
    let index = target.index.as_deref().ok_or_else(|| {
        Error::InvalidUri(format!(
            "{} (hosted clusters need an app name in the path)",
            redact(target.primary())
        ))
    })?;
    let url = format!("{}/{index}/_settings?human", target.primary());
    let body = fetch(http, target, &url).await?;
    let json: Value = serde_json::from_str(&body).map_err(|_| Error::Version {
        uri: url.clone(),
        version: String::new(),
        reason: format!("malformed JSON: {body}"),
    })?;

    json.pointer(&format!("/{index}/settings/index/version/created_string"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Version {
            uri: url,
            version: String::new(),
            reason: format!("missing version: {body}"),
        })
}

async fn fetch(http: &Client, target: &ClusterUri, url: &str) -> Result<String> {
    let mut request = http.get(url);
    if let Some(user) = &target.username {
        request = request.basic_auth(user, target.password.as_deref());
    }
    let response = request
        .send()
        .await
        .map_err(|e| Error::Connect(format!("{}: {e}", redact(url))))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Connect(format!("{}: {e}", redact(url))))?;
    if !status.is_success() {
        return Err(Error::Version {
            uri: redact(url),
            version: String::new(),
            reason: format!("bad status code: {}", status.as_u16()),
        });
    }
    Ok(body)
}

/// Parses `7.10`, `8.11.1` or `6.8.0-SNAPSHOT` style version strings.
///
/// Missing minor or patch components are filled with zero.
pub fn parse_lenient(raw: &str) -> std::result::Result<Version, String> {
    let trimmed = raw.trim().trim_start_matches('v');
    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) || parts.len() > 3 {
        return Err(format!("not a version: '{raw}'"));
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    let normalized = format!("{}{suffix}", parts.join("."));
    Version::parse(&normalized).map_err(|e| format!("not a version: '{raw}' ({e})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_lenient_fills_components() {
        assert_eq!(parse_lenient("7.10").unwrap(), Version::new(7, 10, 0));
        assert_eq!(parse_lenient("8").unwrap(), Version::new(8, 0, 0));
        assert_eq!(parse_lenient("6.8.23").unwrap(), Version::new(6, 8, 23));
    }

    #[test]
    fn test_parse_lenient_keeps_prerelease() {
        let v = parse_lenient("8.0.0-rc1").unwrap();
        assert_eq!(v.major, 8);
        assert_eq!(v.pre.as_str(), "rc1");
    }

    #[test]
    fn test_parse_lenient_rejects_garbage() {
        assert!(parse_lenient("").is_err());
        assert!(parse_lenient("abc").is_err());
        assert!(parse_lenient("1..2").is_err());
    }

    #[tokio::test]
    async fn test_detect_reads_version_number() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "node-1",
                "version": {"number": "7.17.9"},
                "tagline": "You Know, for Search"
            })))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&format!("{}/idx", server.uri())).unwrap();
        let version = detect(&Client::new(), &target).await.unwrap();
        assert_eq!(version, Version::new(7, 17, 9));
    }

    #[tokio::test]
    async fn test_detect_remaps_opensearch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": {"number": "2.11.0", "distribution": "opensearch"},
                "tagline": "The OpenSearch Project: https://opensearch.org/"
            })))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&server.uri()).unwrap();
        let version = detect(&Client::new(), &target).await.unwrap();
        assert_eq!(version, Version::new(8, 8, 1));
    }

    #[tokio::test]
    async fn test_detect_fails_on_missing_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "x"})))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&server.uri()).unwrap();
        let err = detect(&Client::new(), &target).await.unwrap_err();
        assert!(matches!(err, Error::Version { .. }));
    }

    #[tokio::test]
    async fn test_detect_fails_on_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&server.uri()).unwrap();
        let err = detect(&Client::new(), &target).await.unwrap_err();
        assert!(err.to_string().contains("bad status code: 503"));
    }

    #[tokio::test]
    async fn test_detect_fails_on_malformed_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&server.uri()).unwrap();
        let err = detect(&Client::new(), &target).await.unwrap_err();
        assert!(err.to_string().contains("malformed JSON"));
    }

    #[tokio::test]
    async fn test_detect_connection_refused_is_connect_error() {
        let target = ClusterUri::parse("http://127.0.0.1:1").unwrap();
        let err = detect(&Client::new(), &target).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_probe_hosted_reads_created_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/myapp/_settings"))
            .and(query_param("human", ""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "myapp": {"settings": {"index": {"version": {"created_string": "6.2.4"}}}}
            })))
            .mount(&server)
            .await;

        let target = ClusterUri::parse(&format!("{}/myapp", server.uri())).unwrap();
        let raw = probe_hosted(&Client::new(), &target).await.unwrap();
        assert_eq!(raw, "6.2.4");
    }
}
