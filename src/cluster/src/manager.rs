//! Process-wide cluster handle with cached per-keyspace sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::driver::{ClusterConnection, ClusterDriver, ClusterMetadata, KeyspaceSession};
use crate::error::{ClusterError, ClusterResult};
use crate::options::ClusterOptions;

static PROCESS_CLUSTER: AtomicBool = AtomicBool::new(false);

type SessionCell = Arc<OnceCell<Arc<dyn KeyspaceSession>>>;

/// Owns the single cluster connection of the process and hands out one
/// shared session per keyspace.
pub struct ClusterManager {
    options: ClusterOptions,
    connection: Arc<dyn ClusterConnection>,
    metadata: ClusterMetadata,
    sessions: DashMap<String, SessionCell>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("cluster_name", &self.metadata.cluster_name)
            .field("sessions", &self.sessions.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ClusterManager {
    /// Connect the process-wide cluster handle. Only one handle may be
    /// initialized per process; a second call fails with a configuration
    /// error while the first one exists.
    pub async fn initialize(
        options: ClusterOptions,
        driver: &dyn ClusterDriver,
    ) -> ClusterResult<Arc<Self>> {
        if PROCESS_CLUSTER.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::Configuration(
                "the cluster connection is already initialized".to_string(),
            ));
        }
        let result = Self::connect_isolated(options, driver).await;
        if result.is_err() {
            PROCESS_CLUSTER.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Connect a handle that does not take the process-wide slot. Used by
    /// tools and tests that need several independent connections.
    pub async fn connect_isolated(
        options: ClusterOptions,
        driver: &dyn ClusterDriver,
    ) -> ClusterResult<Arc<Self>> {
        options.validate()?;
        let connection = driver.connect(&options).await.inspect_err(|e| {
            log::error!("Error occurred while creating cluster connection: {e}");
        })?;

        let metadata = connection.metadata();
        log::info!("Connected to cluster: {}", metadata.cluster_name);
        for host in &metadata.hosts {
            log::info!(
                "Datacenter: {}; Host: {}; Rack: {}",
                host.datacenter,
                host.address,
                host.rack
            );
        }

        Ok(Arc::new(Self {
            options,
            connection,
            metadata,
            sessions: DashMap::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ClusterResult<()> {
        if self.is_closed() {
            Err(ClusterError::Closed)
        } else {
            Ok(())
        }
    }

    /// Session bound to `keyspace`. The first call opens it; every later or
    /// concurrent call gets the same session.
    pub async fn session(&self, keyspace: &str) -> ClusterResult<Arc<dyn KeyspaceSession>> {
        self.ensure_open()?;
        let cell = self
            .sessions
            .entry(keyspace.to_string())
            .or_default()
            .value()
            .clone();

        let session = cell
            .get_or_try_init(|| async {
                log::debug!("Opening session for keyspace {keyspace}");
                self.connection.open_session(keyspace).await
            })
            .await
            .inspect_err(|e| log::error!("Failed to open session for keyspace {keyspace}: {e}"))?
            .clone();

        // Shutdown may have raced with the open above.
        if self.is_closed() {
            let _ = session.close().await;
            return Err(ClusterError::Closed);
        }
        Ok(session)
    }

    /// Names of the tables in `keyspace`, in ascending order.
    pub async fn list_tables(&self, keyspace: &str) -> ClusterResult<Vec<String>> {
        self.ensure_open()?;
        self.connection.tables(keyspace).await
    }

    /// Create `keyspace` and `tables` where missing.
    pub async fn ensure_keyspace(&self, keyspace: &str, tables: &[&str]) -> ClusterResult<()> {
        self.ensure_open()?;
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        self.connection.create_keyspace(keyspace, &tables).await
    }

    /// Close every open session, then the connection. Safe to call more
    /// than once; failures are logged and do not stop the shutdown.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down cluster connection");

        let cells: Vec<(String, SessionCell)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.sessions.clear();

        for (keyspace, cell) in cells {
            if let Some(session) = cell.get() {
                if let Err(e) = session.close().await {
                    log::error!("Failed to close session for keyspace {keyspace}: {e}");
                }
            }
        }
        if let Err(e) = self.connection.close().await {
            log::error!("Failed to close cluster connection: {e}");
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        if !self.is_closed() {
            log::warn!("Cluster handle dropped without shutdown");
        }
    }
}

/// Shut `manager` down when the process receives Ctrl-C or SIGTERM.
pub fn spawn_shutdown_hook(manager: Arc<ClusterManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_termination().await;
        log::info!("Termination signal received");
        manager.shutdown().await;
    })
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
