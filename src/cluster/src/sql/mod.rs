//! SQL driver built on sqlx.
//!
//! Two backends are supported, selected by the contact point scheme:
//!
//! - `sqlite::memory:` or `sqlite://<dir>`: a single node; every keyspace is
//!   its own database (in memory, or `<dir>/<keyspace>.db`).
//! - `postgres://...`: one pool per contact host, a keyspace is a schema.
//!   All hosts are expected to serve the same dataset, as the nodes of a
//!   distributed SQL cluster speaking the Postgres protocol do.
//!
//! Each table stores one JSON document per primary key (`pk`, `doc`).

mod postgres;
mod routing;
mod sqlite;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::driver::{ClusterConnection, ClusterDriver, Row};
use crate::error::{ClusterError, ClusterResult};
use crate::options::ClusterOptions;

pub use postgres::PgCluster;
pub use sqlite::SqliteCluster;

/// Driver for SQLite and Postgres-protocol clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlDriver;

#[async_trait]
impl ClusterDriver for SqlDriver {
    async fn connect(&self, options: &ClusterOptions) -> ClusterResult<Arc<dyn ClusterConnection>> {
        match Backend::for_options(options)? {
            Backend::Sqlite(location) => {
                let cluster = SqliteCluster::connect(location, options).await?;
                Ok(Arc::new(cluster))
            }
            Backend::Postgres => {
                let cluster = PgCluster::connect(options).await?;
                Ok(Arc::new(cluster))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqliteLocation {
    Memory,
    Directory(PathBuf),
}

#[derive(Debug, PartialEq, Eq)]
enum Backend {
    Sqlite(SqliteLocation),
    Postgres,
}

impl Backend {
    fn for_options(options: &ClusterOptions) -> ClusterResult<Self> {
        let first = options
            .contact_points
            .first()
            .ok_or_else(|| ClusterError::Configuration("no contact points".to_string()))?;
        let address = first.address.trim();

        if address.starts_with("sqlite:") {
            if options.contact_points.len() > 1 {
                return Err(ClusterError::Configuration(
                    "the SQLite backend accepts exactly one contact point".to_string(),
                ));
            }
            let location = match address {
                "sqlite::memory:" | "sqlite://:memory:" => SqliteLocation::Memory,
                _ => {
                    let path = address
                        .strip_prefix("sqlite://")
                        .or_else(|| address.strip_prefix("sqlite:"))
                        .unwrap_or_default();
                    if path.is_empty() {
                        return Err(ClusterError::Configuration(format!(
                            "SQLite contact point {address} does not name a directory"
                        )));
                    }
                    SqliteLocation::Directory(PathBuf::from(path))
                }
            };
            return Ok(Backend::Sqlite(location));
        }

        let is_postgres =
            |a: &str| a.starts_with("postgres://") || a.starts_with("postgresql://");
        if !is_postgres(address) {
            return Err(ClusterError::Configuration(format!(
                "unsupported contact point scheme: {address}"
            )));
        }
        if let Some(other) = options
            .contact_points
            .iter()
            .find(|cp| !is_postgres(cp.address.trim()))
        {
            return Err(ClusterError::Configuration(format!(
                "cannot mix backends in one cluster: {}",
                other.address
            )));
        }
        Ok(Backend::Postgres)
    }
}

/// Bounds the number of requests in flight on one cluster connection.
#[derive(Clone, Debug)]
pub(crate) struct RequestLimiter {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RequestLimiter {
    pub(crate) fn new(options: &ClusterOptions) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(options.max_in_flight_requests())),
            timeout: options.pooling.pool_timeout,
        }
    }

    pub(crate) async fn acquire(&self) -> ClusterResult<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ClusterError::Closed),
            Err(_) => Err(ClusterError::Connection(format!(
                "timed out after {:?} waiting for a request slot",
                self.timeout
            ))),
        }
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

/// Keyspace and table names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub(crate) fn check_identifier(kind: &str, name: &str) -> ClusterResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 48;
    if valid {
        Ok(())
    } else {
        Err(ClusterError::Configuration(format!(
            "invalid {kind} name: {name:?}"
        )))
    }
}

/// Canonical text of a primary key, independent of column order.
pub(crate) fn key_text(key: &Row) -> ClusterResult<String> {
    if key.is_empty() {
        return Err(ClusterError::Query("empty primary key".to_string()));
    }
    let sorted: BTreeMap<&String, &serde_json::Value> = key.iter().collect();
    serde_json::to_string(&sorted).map_err(|e| ClusterError::Query(e.to_string()))
}

/// Document written for an upsert: the new column values plus the key columns.
pub(crate) fn document_text(key: &Row, values: &Row) -> ClusterResult<String> {
    let mut doc = values.clone();
    for (column, value) in key {
        doc.insert(column.clone(), value.clone());
    }
    serde_json::to_string(&doc).map_err(|e| ClusterError::Query(e.to_string()))
}

/// Column names and JSON texts of the values a conditional write expects.
pub(crate) fn condition_text(expected: &Row) -> ClusterResult<Vec<(&str, String)>> {
    if expected.is_empty() {
        return Err(ClusterError::Query("empty delete condition".to_string()));
    }
    expected
        .iter()
        .map(|(column, value)| {
            check_identifier("column", column)?;
            let text =
                serde_json::to_string(value).map_err(|e| ClusterError::Query(e.to_string()))?;
            Ok((column.as_str(), text))
        })
        .collect()
}

pub(crate) fn decode_row(text: &str) -> ClusterResult<Row> {
    serde_json::from_str(text).map_err(|e| ClusterError::Query(format!("corrupt row: {e}")))
}

pub(crate) fn map_sqlx_error(err: sqlx::Error, keyspace: &str, table: Option<&str>) -> ClusterError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let missing_table =
                code.as_deref() == Some("42P01") || db.message().contains("no such table");
            match table {
                Some(table) if missing_table => ClusterError::TableNotFound {
                    keyspace: keyspace.to_string(),
                    table: table.to_string(),
                },
                _ if code.as_deref() == Some("3F000") => {
                    ClusterError::KeyspaceNotFound(keyspace.to_string())
                }
                _ => ClusterError::Query(err.to_string()),
            }
        }
        sqlx::Error::PoolClosed => ClusterError::Closed,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            ClusterError::Connection(err.to_string())
        }
        _ => ClusterError::Query(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::row;
    use common::config::ContactPoint;
    use serde_json::json;

    fn options(addresses: &[&str]) -> ClusterOptions {
        ClusterOptions::new(addresses.iter().map(|a| ContactPoint::new(*a)).collect())
    }

    #[test]
    fn test_backend_selection() {
        assert_eq!(
            Backend::for_options(&options(&["sqlite::memory:"])).unwrap(),
            Backend::Sqlite(SqliteLocation::Memory)
        );
        assert_eq!(
            Backend::for_options(&options(&["sqlite:///var/lib/identity"])).unwrap(),
            Backend::Sqlite(SqliteLocation::Directory(PathBuf::from("/var/lib/identity")))
        );
        assert_eq!(
            Backend::for_options(&options(&["postgres://a/db", "postgresql://b/db"])).unwrap(),
            Backend::Postgres
        );
    }

    #[test]
    fn test_backend_rejects_bad_contact_points() {
        assert!(Backend::for_options(&options(&["cassandra://a"])).is_err());
        assert!(Backend::for_options(&options(&["postgres://a/db", "sqlite::memory:"])).is_err());
        assert!(Backend::for_options(&options(&["sqlite::memory:", "sqlite::memory:"])).is_err());
        assert!(Backend::for_options(&options(&["sqlite://"])).is_err());
    }

    #[test]
    fn test_identifier_check() {
        assert!(check_identifier("table", "user_lookup").is_ok());
        assert!(check_identifier("table", "_private2").is_ok());
        assert!(check_identifier("table", "2fast").is_err());
        assert!(check_identifier("table", "user\"; DROP TABLE x; --").is_err());
        assert!(check_identifier("keyspace", "").is_err());
    }

    #[test]
    fn test_key_text_is_order_independent() {
        let a = row([("type", json!("email")), ("value", json!("a@x.com"))]);
        let b = row([("value", json!("a@x.com")), ("type", json!("email"))]);
        assert_eq!(key_text(&a).unwrap(), key_text(&b).unwrap());
        assert!(key_text(&Row::new()).is_err());
    }

    #[test]
    fn test_condition_text_checks_columns() {
        let expected = row([("userId", json!("u1")), ("note", json!(null))]);
        let mut columns = condition_text(&expected).unwrap();
        columns.sort();
        assert_eq!(
            columns,
            vec![("note", "null".to_string()), ("userId", "\"u1\"".to_string())]
        );
        assert!(condition_text(&Row::new()).is_err());
        assert!(condition_text(&row([("user') OR 1=1 --", json!("u1"))])).is_err());
    }

    #[test]
    fn test_document_text_includes_key_columns() {
        let key = row([("id", json!("u1"))]);
        let values = row([("email", json!(null)), ("flagsValue", json!(1))]);
        let doc = decode_row(&document_text(&key, &values).unwrap()).unwrap();
        assert_eq!(doc.get("id"), Some(&json!("u1")));
        assert_eq!(doc.get("email"), Some(&json!(null)));
        assert_eq!(doc.get("flagsValue"), Some(&json!(1)));
    }
}
