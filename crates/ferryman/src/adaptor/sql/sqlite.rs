//! SQLite source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;

use super::{connect_pool, SqlSession, TableReader};
use crate::adaptor::config::{parse_duration, DEFAULT_TIMEOUT};
use crate::adaptor::{Adaptor, Role, SOURCE_ROLES};
use crate::client::{Client, Reader, Session};
use crate::error::{Error, Result};

const SAMPLE_CONFIG: &str = r#"{
  "uri": "sqlite:///path/to/database.db"
  // "timeout": "30s"
}"#;

/// SQLite adaptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sqlite {
    /// `sqlite://` URI or a bare path.
    pub uri: String,
    /// Pool acquire timeout.
    pub timeout: String,
}

impl Default for Sqlite {
    fn default() -> Self {
        Self {
            uri: "sqlite://test.db".to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
        }
    }
}

/// Registry factory.
pub fn factory() -> Box<dyn Adaptor> {
    Box::new(Sqlite::default())
}

/// Accepts bare paths as well as `sqlite:` URIs.
fn normalize_uri(uri: &str) -> String {
    if uri.starts_with("sqlite:") {
        uri.to_string()
    } else {
        format!("sqlite://{uri}")
    }
}

#[async_trait]
impl Adaptor for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn description(&self) -> &'static str {
        "a sqlite source adaptor"
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    fn roles(&self) -> &'static [Role] {
        SOURCE_ROLES
    }

    fn client(&self) -> Result<Box<dyn Client>> {
        Ok(Box::new(SqliteClient {
            uri: normalize_uri(&self.uri),
            timeout: parse_duration(&self.timeout)?,
            pool: None,
        }))
    }

    fn reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(TableReader))
    }
}

/// Opens a connection pool.
pub struct SqliteClient {
    uri: String,
    timeout: Duration,
    pool: Option<SqlitePool>,
}

#[async_trait]
impl Client for SqliteClient {
    async fn connect(&mut self) -> Result<Session> {
        if self.pool.is_none() {
            let options = SqlitePoolOptions::new()
                .max_connections(2)
                .acquire_timeout(self.timeout);
            self.pool = Some(connect_pool(&self.uri, options.connect(&self.uri)).await?);
        }
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::Connect("sqlite pool unavailable".to_string()))?;
        Ok(Session::Sql(SqlSession::Sqlite(pool)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_uri() {
        assert_eq!(normalize_uri("/tmp/a.db"), "sqlite:///tmp/a.db");
        assert_eq!(normalize_uri("sqlite://x.db"), "sqlite://x.db");
        assert_eq!(normalize_uri("sqlite::memory:"), "sqlite::memory:");
    }
}
