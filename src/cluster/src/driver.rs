//! Driver seam between the session manager and a concrete store.
//!
//! Rows are column maps. Writes merge the given columns into the stored row
//! and a `null` column value removes that column, the way an update on a
//! wide-column store does.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClusterResult;
use crate::options::ClusterOptions;

/// A row as a map of column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Build a row from `(column, value)` pairs.
pub fn row<K, V, I>(columns: I) -> Row
where
    K: Into<String>,
    V: Into<serde_json::Value>,
    I: IntoIterator<Item = (K, V)>,
{
    columns
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A host known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub address: String,
    pub datacenter: String,
    pub rack: String,
}

/// Cluster topology as seen at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub cluster_name: String,
    pub hosts: Vec<HostInfo>,
}

/// Opens cluster connections.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn connect(&self, options: &ClusterOptions) -> ClusterResult<Arc<dyn ClusterConnection>>;
}

/// A live connection to the whole cluster.
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    fn metadata(&self) -> ClusterMetadata;

    /// Open a session scoped to `keyspace`; fails with `KeyspaceNotFound`
    /// when the keyspace has not been provisioned.
    async fn open_session(&self, keyspace: &str) -> ClusterResult<Arc<dyn KeyspaceSession>>;

    /// Table names of `keyspace` in ascending order.
    async fn tables(&self, keyspace: &str) -> ClusterResult<Vec<String>>;

    /// Create `keyspace` and `tables` when they do not exist yet.
    async fn create_keyspace(&self, keyspace: &str, tables: &[String]) -> ClusterResult<()>;

    async fn close(&self) -> ClusterResult<()>;
}

/// A reusable, concurrency-safe session bound to one keyspace.
#[async_trait]
pub trait KeyspaceSession: Send + Sync {
    fn keyspace(&self) -> &str;

    async fn get(&self, table: &str, key: &Row) -> ClusterResult<Option<Row>>;

    async fn scan(&self, table: &str) -> ClusterResult<Vec<Row>>;

    /// Merge `values` into the row identified by `key`, creating it if needed.
    async fn upsert(&self, table: &str, key: &Row, values: &Row) -> ClusterResult<()>;

    async fn delete(&self, table: &str, key: &Row) -> ClusterResult<()>;

    /// Delete the row identified by `key` only while every column of
    /// `expected` still holds the given value (`null`: the column is unset).
    /// Returns whether a row was deleted.
    async fn delete_if(&self, table: &str, key: &Row, expected: &Row) -> ClusterResult<bool>;

    async fn close(&self) -> ClusterResult<()>;
}

impl std::fmt::Debug for dyn KeyspaceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyspaceSession")
            .field("keyspace", &self.keyspace())
            .finish()
    }
}
