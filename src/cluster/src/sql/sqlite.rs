use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use super::{
    RequestLimiter, SqliteLocation, check_identifier, condition_text, decode_row, document_text,
    key_text, map_sqlx_error,
};
use crate::driver::{ClusterConnection, ClusterMetadata, HostInfo, KeyspaceSession, Row};
use crate::error::{ClusterError, ClusterResult};
use crate::options::{ClusterOptions, ConsistencyLevel, HostDistance};

fn synchronous_mode(level: ConsistencyLevel) -> SqliteSynchronous {
    match level {
        ConsistencyLevel::Any => SqliteSynchronous::Off,
        ConsistencyLevel::One | ConsistencyLevel::LocalOne => SqliteSynchronous::Normal,
        _ => SqliteSynchronous::Full,
    }
}

/// Single-node cluster where each keyspace is a SQLite database.
pub struct SqliteCluster {
    location: SqliteLocation,
    options: ClusterOptions,
    keyspaces: DashMap<String, SqlitePool>,
    limiter: RequestLimiter,
    closed: AtomicBool,
}

impl SqliteCluster {
    pub(crate) async fn connect(
        location: SqliteLocation,
        options: &ClusterOptions,
    ) -> ClusterResult<Self> {
        if let SqliteLocation::Directory(dir) = &location {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ClusterError::Connection(format!(
                    "cannot open data directory {}: {e}",
                    dir.display()
                ))
            })?;
            log::info!("SQLite cluster storing keyspaces in {}", dir.display());
        } else {
            log::info!("SQLite cluster running in memory");
        }

        Ok(Self {
            location,
            options: options.clone(),
            keyspaces: DashMap::new(),
            limiter: RequestLimiter::new(options),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    async fn open_pool(&self, keyspace: &str, create: bool) -> ClusterResult<SqlitePool> {
        let mut connect_options = match &self.location {
            // Every parse of `:memory:` yields a fresh database.
            SqliteLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ClusterError::Configuration(e.to_string()))?,
            SqliteLocation::Directory(dir) => SqliteConnectOptions::new()
                .filename(dir.join(format!("{keyspace}.db")))
                .create_if_missing(create)
                .journal_mode(SqliteJournalMode::Wal),
        };
        if let Some(level) = self.options.consistency {
            connect_options = connect_options.synchronous(synchronous_mode(level));
        }

        let (core, max) = HostDistance::Local.connection_limits(&self.options.pooling);
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max)
            .min_connections(core)
            .acquire_timeout(self.options.pooling.pool_timeout);
        if self.location == SqliteLocation::Memory {
            // The database lives as long as its single connection stays open.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| ClusterError::Connection(format!("keyspace {keyspace}: {e}")))
    }

    async fn keyspace_pool(&self, keyspace: &str) -> ClusterResult<SqlitePool> {
        self.ensure_open()?;
        check_identifier("keyspace", keyspace)?;
        if let Some(pool) = self.keyspaces.get(keyspace) {
            return Ok(pool.value().clone());
        }

        let SqliteLocation::Directory(dir) = &self.location else {
            return Err(ClusterError::KeyspaceNotFound(keyspace.to_string()));
        };
        let path = dir.join(format!("{keyspace}.db"));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ClusterError::KeyspaceNotFound(keyspace.to_string()));
        }
        let pool = self.open_pool(keyspace, false).await?;
        Ok(self.register(keyspace, pool).await)
    }

    /// Store `pool` for `keyspace` unless another task got there first.
    async fn register(&self, keyspace: &str, pool: SqlitePool) -> SqlitePool {
        let mut inserted = false;
        let winner = self
            .keyspaces
            .entry(keyspace.to_string())
            .or_insert_with(|| {
                inserted = true;
                pool.clone()
            })
            .clone();
        if !inserted {
            pool.close().await;
        }
        winner
    }
}

#[async_trait]
impl ClusterConnection for SqliteCluster {
    fn metadata(&self) -> ClusterMetadata {
        let hosts = self
            .options
            .contact_points
            .iter()
            .map(|cp| HostInfo {
                address: cp.address.clone(),
                datacenter: cp.datacenter.clone().unwrap_or_else(|| "local".to_string()),
                rack: cp.rack.clone().unwrap_or_else(|| "local".to_string()),
            })
            .collect();
        ClusterMetadata {
            cluster_name: "sqlite".to_string(),
            hosts,
        }
    }

    async fn open_session(&self, keyspace: &str) -> ClusterResult<Arc<dyn KeyspaceSession>> {
        let pool = self.keyspace_pool(keyspace).await?;
        Ok(Arc::new(SqliteSession {
            keyspace: keyspace.to_string(),
            pool,
            limiter: self.limiter.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn tables(&self, keyspace: &str) -> ClusterResult<Vec<String>> {
        let pool = self.keyspace_pool(keyspace).await?;
        let _permit = self.limiter.acquire().await?;
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error(e, keyspace, None))
    }

    async fn create_keyspace(&self, keyspace: &str, tables: &[String]) -> ClusterResult<()> {
        self.ensure_open()?;
        check_identifier("keyspace", keyspace)?;
        for table in tables {
            check_identifier("table", table)?;
        }

        let existing = self.keyspaces.get(keyspace).map(|p| p.value().clone());
        let pool = match existing {
            Some(pool) => pool,
            None => {
                let pool = self.open_pool(keyspace, true).await?;
                self.register(keyspace, pool).await
            }
        };

        for table in tables {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (pk TEXT PRIMARY KEY NOT NULL, doc TEXT NOT NULL)"
            );
            sqlx::query(&ddl)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error(e, keyspace, Some(table)))?;
        }
        log::debug!("Keyspace {keyspace} provisioned with tables {tables:?}");
        Ok(())
    }

    async fn close(&self) -> ClusterResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.limiter.close();
        let pools: Vec<SqlitePool> = self.keyspaces.iter().map(|p| p.value().clone()).collect();
        self.keyspaces.clear();
        for pool in pools {
            pool.close().await;
        }
        Ok(())
    }
}

struct SqliteSession {
    keyspace: String,
    pool: SqlitePool,
    limiter: RequestLimiter,
    closed: AtomicBool,
}

impl SqliteSession {
    fn check(&self, table: &str) -> ClusterResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        check_identifier("table", table)
    }

    fn error<'a>(&'a self, table: &'a str) -> impl FnOnce(sqlx::Error) -> ClusterError + 'a {
        move |e| map_sqlx_error(e, &self.keyspace, Some(table))
    }
}

#[async_trait]
impl KeyspaceSession for SqliteSession {
    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    async fn get(&self, table: &str, key: &Row) -> ClusterResult<Option<Row>> {
        self.check(table)?;
        let pk = key_text(key)?;
        let _permit = self.limiter.acquire().await?;
        let doc: Option<String> =
            sqlx::query_scalar(&format!("SELECT doc FROM \"{table}\" WHERE pk = ?"))
                .bind(pk)
                .fetch_optional(&self.pool)
                .await
                .map_err(self.error(table))?;
        doc.as_deref().map(decode_row).transpose()
    }

    async fn scan(&self, table: &str) -> ClusterResult<Vec<Row>> {
        self.check(table)?;
        let _permit = self.limiter.acquire().await?;
        let docs: Vec<String> =
            sqlx::query_scalar(&format!("SELECT doc FROM \"{table}\" ORDER BY pk"))
                .fetch_all(&self.pool)
                .await
                .map_err(self.error(table))?;
        docs.iter().map(|doc| decode_row(doc)).collect()
    }

    async fn upsert(&self, table: &str, key: &Row, values: &Row) -> ClusterResult<()> {
        self.check(table)?;
        let pk = key_text(key)?;
        let doc = document_text(key, values)?;
        let _permit = self.limiter.acquire().await?;
        // json_patch drops members whose patch value is null.
        let sql = format!(
            "INSERT INTO \"{table}\" (pk, doc) VALUES (?, json_patch('{{}}', ?)) \
             ON CONFLICT(pk) DO UPDATE SET doc = json_patch(doc, ?)"
        );
        sqlx::query(&sql)
            .bind(pk)
            .bind(&doc)
            .bind(&doc)
            .execute(&self.pool)
            .await
            .map_err(self.error(table))?;
        Ok(())
    }

    async fn delete(&self, table: &str, key: &Row) -> ClusterResult<()> {
        self.check(table)?;
        let pk = key_text(key)?;
        let _permit = self.limiter.acquire().await?;
        sqlx::query(&format!("DELETE FROM \"{table}\" WHERE pk = ?"))
            .bind(pk)
            .execute(&self.pool)
            .await
            .map_err(self.error(table))?;
        Ok(())
    }

    async fn delete_if(&self, table: &str, key: &Row, expected: &Row) -> ClusterResult<bool> {
        self.check(table)?;
        let pk = key_text(key)?;
        let conditions = condition_text(expected)?;
        let mut sql = format!("DELETE FROM \"{table}\" WHERE pk = ?");
        for (column, _) in &conditions {
            sql.push_str(&format!(
                " AND json_extract(doc, '$.{column}') IS json_extract(?, '$')"
            ));
        }
        let _permit = self.limiter.acquire().await?;
        let mut query = sqlx::query(&sql).bind(pk);
        for (_, value) in &conditions {
            query = query.bind(value.as_str());
        }
        let result = query.execute(&self.pool).await.map_err(self.error(table))?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) -> ClusterResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronous_mode_follows_consistency() {
        assert!(matches!(
            synchronous_mode(ConsistencyLevel::Any),
            SqliteSynchronous::Off
        ));
        assert!(matches!(
            synchronous_mode(ConsistencyLevel::LocalOne),
            SqliteSynchronous::Normal
        ));
        assert!(matches!(
            synchronous_mode(ConsistencyLevel::LocalQuorum),
            SqliteSynchronous::Full
        ));
    }
}
