//! Connection handles returned by [`Client::connect`](super::Client::connect).

use crate::adaptor::elasticsearch::EsSession;
use crate::adaptor::file::FileSession;
use crate::adaptor::firestore::FirestoreSession;
#[cfg(feature = "kafka")]
use crate::adaptor::kafka::KafkaSession;
use crate::adaptor::mongodb::MongoSession;
#[cfg(feature = "mssql")]
use crate::adaptor::mssql::MssqlSession;
use crate::adaptor::redis::RedisSession;
#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
use crate::adaptor::sql::SqlSession;
use crate::error::{Error, Result};

/// An open connection, one variant per adaptor family.
///
/// Readers and writers take the variant they were built for and fail with
/// [`Error::SessionMismatch`] on anything else.
#[derive(Debug, Clone)]
pub enum Session {
    /// Search cluster connection with its detected version.
    Elasticsearch(EsSession),
    /// SQL connection pool.
    #[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
    Sql(SqlSession),
    /// Multiplexed Redis connection.
    Redis(RedisSession),
    /// Local, remote or stdout file handle.
    File(FileSession),
    /// Firestore REST endpoint.
    Firestore(FirestoreSession),
    /// Kafka broker settings.
    #[cfg(feature = "kafka")]
    Kafka(KafkaSession),
    /// MongoDB Data API endpoint.
    MongoDb(MongoSession),
    /// SQL Server connection.
    #[cfg(feature = "mssql")]
    Mssql(MssqlSession),
}

macro_rules! session_accessor {
    ($method:ident, $variant:ident, $ty:ty, $kind:literal) => {
        #[doc = concat!("Unwraps the ", $kind, " session.")]
        pub fn $method(self) -> Result<$ty> {
            match self {
                Self::$variant(inner) => Ok(inner),
                #[allow(unreachable_patterns)]
                other => Err(Error::SessionMismatch {
                    expected: $kind,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl Session {
    /// Short name of the adaptor family.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Elasticsearch(_) => "elasticsearch",
            #[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
            Self::Sql(_) => "sql",
            Self::Redis(_) => "redis",
            Self::File(_) => "file",
            Self::Firestore(_) => "firestore",
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
            Self::MongoDb(_) => "mongodb",
            #[cfg(feature = "mssql")]
            Self::Mssql(_) => "mssql",
        }
    }

    session_accessor!(into_elasticsearch, Elasticsearch, EsSession, "elasticsearch");
    #[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
    session_accessor!(into_sql, Sql, SqlSession, "sql");
    session_accessor!(into_redis, Redis, RedisSession, "redis");
    session_accessor!(into_file, File, FileSession, "file");
    session_accessor!(into_firestore, Firestore, FirestoreSession, "firestore");
    #[cfg(feature = "kafka")]
    session_accessor!(into_kafka, Kafka, KafkaSession, "kafka");
    session_accessor!(into_mongodb, MongoDb, MongoSession, "mongodb");
    #[cfg(feature = "mssql")]
    session_accessor!(into_mssql, Mssql, MssqlSession, "mssql");
}
