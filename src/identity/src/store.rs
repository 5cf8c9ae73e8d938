//! Keyed single-row access to keyspace tables.

use std::sync::Arc;

use async_trait::async_trait;
use cluster::{ClusterManager, Row, row};
use serde_json::Value;

use crate::error::IdentityResult;

/// Record store used by the identity operations. Every call touches one row
/// or scans one table; there are no multi-row transactions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Row of `table` whose `id` column equals `id`.
    async fn get_by_id(&self, keyspace: &str, table: &str, id: &str)
    -> IdentityResult<Option<Row>>;

    async fn get(&self, keyspace: &str, table: &str, key: &Row) -> IdentityResult<Option<Row>>;

    async fn get_all(&self, keyspace: &str, table: &str) -> IdentityResult<Vec<Row>>;

    /// Write `values` into the row at `key`; `null` values clear columns.
    async fn put(&self, keyspace: &str, table: &str, key: &Row, values: &Row)
    -> IdentityResult<()>;

    async fn delete(&self, keyspace: &str, table: &str, key: &Row) -> IdentityResult<()>;

    /// Delete the row at `key` only while the columns of `expected` still
    /// hold those values. Returns whether the row was deleted.
    async fn delete_if(
        &self,
        keyspace: &str,
        table: &str,
        key: &Row,
        expected: &Row,
    ) -> IdentityResult<bool>;
}

/// Key of a row addressed by its `id` column.
pub fn id_key(id: &str) -> Row {
    row([("id", Value::from(id))])
}

/// [`RecordStore`] over the sessions of a [`ClusterManager`].
#[derive(Debug, Clone)]
pub struct ClusterRecordStore {
    cluster: Arc<ClusterManager>,
}

impl ClusterRecordStore {
    pub fn new(cluster: Arc<ClusterManager>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl RecordStore for ClusterRecordStore {
    async fn get_by_id(
        &self,
        keyspace: &str,
        table: &str,
        id: &str,
    ) -> IdentityResult<Option<Row>> {
        self.get(keyspace, table, &id_key(id)).await
    }

    async fn get(&self, keyspace: &str, table: &str, key: &Row) -> IdentityResult<Option<Row>> {
        let session = self.cluster.session(keyspace).await?;
        let found = session.get(table, key).await?;
        log::debug!(
            "Read {keyspace}.{table} {key:?}: {}",
            if found.is_some() { "found" } else { "absent" }
        );
        Ok(found)
    }

    async fn get_all(&self, keyspace: &str, table: &str) -> IdentityResult<Vec<Row>> {
        let session = self.cluster.session(keyspace).await?;
        Ok(session.scan(table).await?)
    }

    async fn put(
        &self,
        keyspace: &str,
        table: &str,
        key: &Row,
        values: &Row,
    ) -> IdentityResult<()> {
        let session = self.cluster.session(keyspace).await?;
        session.upsert(table, key, values).await?;
        log::debug!("Wrote {} columns to {keyspace}.{table} {key:?}", values.len());
        Ok(())
    }

    async fn delete(&self, keyspace: &str, table: &str, key: &Row) -> IdentityResult<()> {
        let session = self.cluster.session(keyspace).await?;
        session.delete(table, key).await?;
        log::debug!("Deleted {keyspace}.{table} {key:?}");
        Ok(())
    }

    async fn delete_if(
        &self,
        keyspace: &str,
        table: &str,
        key: &Row,
        expected: &Row,
    ) -> IdentityResult<bool> {
        let session = self.cluster.session(keyspace).await?;
        let deleted = session.delete_if(table, key, expected).await?;
        log::debug!(
            "Conditional delete of {keyspace}.{table} {key:?}: {}",
            if deleted { "deleted" } else { "condition not met" }
        );
        Ok(deleted)
    }
}
