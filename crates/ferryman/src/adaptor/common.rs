//! Common utilities shared across adaptors.
//!
//! HTTP client construction, error mapping for HTTP responses, URI
//! validation and the type-cast helpers used by string-typed sources.

use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

use crate::error::{Error, Result};

/// Connect timeout for all HTTP based adaptors.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum size of a file downloaded over HTTP (100MB).
pub const MAX_DOWNLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Creates a configured HTTP client with the adaptor's timeout.
pub fn create_http_client(timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT.min(timeout_or(timeout)));
    if !timeout.is_zero() {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::Connect(format!("cannot build HTTP client: {e}")))
}

fn timeout_or(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        CONNECT_TIMEOUT
    } else {
        timeout
    }
}

/// Validates that `uri` uses one of the `allowed` schemes.
pub fn validate_scheme(uri: &str, allowed: &[&str]) -> Result<()> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(Error::InvalidUri(uri.to_string()));
    };
    if rest.is_empty() || !allowed.contains(&scheme) {
        return Err(Error::InvalidUri(format!(
            "{uri} (allowed schemes: {})",
            allowed.join(", ")
        )));
    }
    Ok(())
}

/// Handles HTTP error responses and returns appropriate errors.
pub fn handle_http_error(status_code: u16, body: &str, source_name: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("{source_name} auth failed: {body}")),
        _ => Error::Connect(format!("{source_name} error {status_code}: {body}")),
    }
}

/// Turns a non-success response into an error, passing successes through.
pub async fn check_response(response: Response, source_name: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(handle_http_error(status.as_u16(), &body, source_name))
}

/// Hides the password of a connection URI.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => uri.to_string(),
    }
}

/// Best-effort typing of a string cell: integers, floats and booleans are
/// converted, everything else stays a string.
pub fn cast_str(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_http_error_rate_limit() {
        let err = handle_http_error(429, "too many requests", "Elasticsearch");
        assert!(matches!(err, Error::RateLimit(60)));
    }

    #[test]
    fn test_handle_http_error_auth() {
        let err = handle_http_error(401, "unauthorized", "Elasticsearch");
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_handle_http_error_other() {
        let err = handle_http_error(500, "internal error", "Firestore");
        assert!(matches!(err, Error::Connect(_)));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_validate_scheme() {
        assert!(validate_scheme("redis://localhost:6379", &["redis", "rediss"]).is_ok());
        assert!(validate_scheme("ftp://files.example.com", &["http", "https"]).is_err());
        assert!(validate_scheme("localhost:6379", &["redis"]).is_err());
        assert!(validate_scheme("redis://", &["redis"]).is_err());
    }

    #[test]
    fn test_cast_str() {
        assert_eq!(cast_str("42"), json!(42));
        assert_eq!(cast_str("4.5"), json!(4.5));
        assert_eq!(cast_str("true"), json!(true));
        assert_eq!(cast_str("hello"), json!("hello"));
        assert_eq!(cast_str("NaN"), json!("NaN"));
    }

    #[test]
    fn test_create_http_client() {
        let client = create_http_client(Duration::from_secs(5)).unwrap();
        assert!(client.get("http://example.com").build().is_ok());
    }
}
