use std::sync::Arc;

use anyhow::{Context, Result};
use cluster::{ClusterManager, ClusterOptions, SqlDriver};
use common::config::Configuration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::reclaim::{FreeUpOutcome, FreeUpRequest, IdentifierReclaimer, ReclaimSettings};
use crate::reconcile::LookupReconciler;
use crate::role_group::RoleGroupDao;
use crate::search;
use crate::store::{ClusterRecordStore, RecordStore};

/// Wires the cluster connection, the search index and the reclamation
/// components together.
pub struct IdentityService {
    cluster: Arc<ClusterManager>,
    reclaimer: Arc<IdentifierReclaimer>,
    reconciler: Arc<LookupReconciler>,
    role_groups: RoleGroupDao,
    reconciler_handle: Option<JoinHandle<()>>,
}

impl IdentityService {
    /// Start the service on the process-wide cluster connection.
    pub async fn start(config: &Configuration) -> Result<Self> {
        let options = ClusterOptions::from_config(&config.cluster)
            .context("Invalid cluster configuration")?;
        let cluster = ClusterManager::initialize(options, &SqlDriver)
            .await
            .context("Failed to connect to the cluster")?;
        Self::build(config, cluster).await
    }

    /// Start the service on a connection of its own, leaving the
    /// process-wide slot free.
    pub async fn start_isolated(config: &Configuration) -> Result<Self> {
        let options = ClusterOptions::from_config(&config.cluster)
            .context("Invalid cluster configuration")?;
        let cluster = ClusterManager::connect_isolated(options, &SqlDriver)
            .await
            .context("Failed to connect to the cluster")?;
        Self::build(config, cluster).await
    }

    async fn build(config: &Configuration, cluster: Arc<ClusterManager>) -> Result<Self> {
        let reclamation = &config.reclamation;
        if reclamation.provision_schema {
            let provisioned = cluster
                .ensure_keyspace(
                    &reclamation.keyspace,
                    &[
                        reclamation.user_table.as_str(),
                        reclamation.lookup_table.as_str(),
                        reclamation.role_group_table.as_str(),
                    ],
                )
                .await;
            if let Err(e) = provisioned {
                cluster.shutdown().await;
                return Err(e).context("Failed to provision the identity keyspace");
            }
        }

        let index = match search::from_config(&config.search) {
            Ok(index) => index,
            Err(e) => {
                cluster.shutdown().await;
                return Err(e).context("Failed to initialize the search index");
            }
        };

        let store: Arc<dyn RecordStore> = Arc::new(ClusterRecordStore::new(cluster.clone()));
        let settings = ReclaimSettings::from_config(config);
        let (cleanup_tx, cleanup_rx) = mpsc::channel(reclamation.retry_queue_capacity.max(1));

        let reconciler = Arc::new(
            LookupReconciler::new(store.clone(), &settings)
                .with_retry_backoff(reclamation.retry_backoff, reclamation.retry_attempts),
        );
        let reclaimer = Arc::new(
            IdentifierReclaimer::new(store.clone(), index, settings).with_cleanup_queue(cleanup_tx),
        );
        let role_groups =
            RoleGroupDao::new(store, &reclamation.keyspace, &reclamation.role_group_table);

        let sweep_interval = reclamation
            .sweep_enabled
            .then_some(reclamation.sweep_interval);
        let reconciler_handle = reconciler.clone().spawn(sweep_interval, cleanup_rx);

        log::info!(
            "Identity service ready on keyspace {} (lookup sweep: {})",
            reclamation.keyspace,
            match sweep_interval {
                Some(interval) => format!("every {interval:?}"),
                None => "disabled".to_string(),
            }
        );

        Ok(Self {
            cluster,
            reclaimer,
            reconciler,
            role_groups,
            reconciler_handle: Some(reconciler_handle),
        })
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn reclaimer(&self) -> &Arc<IdentifierReclaimer> {
        &self.reclaimer
    }

    pub fn reconciler(&self) -> &Arc<LookupReconciler> {
        &self.reconciler
    }

    pub fn role_groups(&self) -> &RoleGroupDao {
        &self.role_groups
    }

    pub async fn free_up(&self, request: FreeUpRequest) -> crate::IdentityResult<FreeUpOutcome> {
        self.reclaimer.free_up(request).await
    }

    /// Stop the reconciler and close the cluster connection.
    pub async fn shutdown(mut self) {
        log::info!("Shutting down identity service");
        if let Some(handle) = self.reconciler_handle.take() {
            handle.abort();
        }
        self.cluster.shutdown().await;
    }
}

impl Drop for IdentityService {
    fn drop(&mut self) {
        if let Some(handle) = self.reconciler_handle.take() {
            handle.abort();
        }
    }
}
