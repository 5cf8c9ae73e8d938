//! Host selection and failover for multi-host clusters.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::driver::HostInfo;
use crate::error::{ClusterError, ClusterResult};
use crate::options::HostDistance;

pub(crate) struct PgHost {
    pub(crate) info: HostInfo,
    pub(crate) distance: HostDistance,
    pub(crate) pool: PgPool,
    up: AtomicBool,
}

impl PgHost {
    pub(crate) fn new(info: HostInfo, distance: HostDistance, pool: PgPool, up: bool) -> Self {
        Self {
            info,
            distance,
            pool,
            up: AtomicBool::new(up),
        }
    }

    pub(crate) fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    fn mark(&self, up: bool) {
        let was_up = self.up.swap(up, Ordering::Relaxed);
        if was_up != up {
            if up {
                log::info!("Host {} is back up", self.info.address);
            } else {
                log::warn!("Host {} marked down", self.info.address);
            }
        }
    }
}

pub(crate) struct HostSet {
    hosts: Vec<PgHost>,
    round_robin: bool,
    next: AtomicUsize,
}

impl HostSet {
    pub(crate) fn new(hosts: Vec<PgHost>, round_robin: bool) -> Self {
        Self {
            hosts,
            round_robin,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn hosts(&self) -> &[PgHost] {
        &self.hosts
    }

    fn query_plan(&self) -> Vec<&PgHost> {
        let states: Vec<(HostDistance, bool)> =
            self.hosts.iter().map(|h| (h.distance, h.is_up())).collect();
        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        plan_order(&states, self.round_robin, counter)
            .into_iter()
            .map(|i| &self.hosts[i])
            .collect()
    }

    /// Run `op` against the hosts of the query plan until one does not fail
    /// with a connection error. Only idempotent statements go through here,
    /// so retrying on the next host is safe.
    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> ClusterResult<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let mut last_error = None;
        for host in self.query_plan() {
            match op(host.pool.clone()).await {
                Err(ClusterError::Connection(e)) => {
                    log::warn!("Request to {} failed: {e}", host.info.address);
                    host.mark(false);
                    last_error = Some(ClusterError::Connection(e));
                }
                result => {
                    host.mark(true);
                    return result;
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ClusterError::Connection("no hosts available".to_string())))
    }

    /// Probe every host each `interval` and update its up/down state.
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hosts = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for host in &hosts.hosts {
                    let alive = sqlx::query("SELECT 1").execute(&host.pool).await.is_ok();
                    host.mark(alive);
                }
            }
        })
    }

    pub(crate) async fn close(&self) {
        for host in &self.hosts {
            host.pool.close().await;
        }
    }
}

/// Order in which hosts are tried: local hosts (rotated when round robin is
/// on) before remote ones, and hosts believed up before hosts believed down.
pub(crate) fn plan_order(
    hosts: &[(HostDistance, bool)],
    round_robin: bool,
    counter: usize,
) -> Vec<usize> {
    let (mut plan, remote): (Vec<usize>, Vec<usize>) =
        (0..hosts.len()).partition(|&i| hosts[i].0 == HostDistance::Local);
    if round_robin && !plan.is_empty() {
        let len = plan.len();
        plan.rotate_left(counter % len);
    }
    plan.extend(remote);
    plan.sort_by_key(|&i| !hosts[i].1);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use HostDistance::{Local, Remote};

    #[test]
    fn test_contact_order_keeps_configured_order() {
        let hosts = [(Local, true), (Local, true), (Local, true)];
        assert_eq!(plan_order(&hosts, false, 0), vec![0, 1, 2]);
        assert_eq!(plan_order(&hosts, false, 7), vec![0, 1, 2]);
    }

    #[test]
    fn test_round_robin_rotates_local_hosts_only() {
        let hosts = [(Local, true), (Remote, true), (Local, true), (Local, true)];
        assert_eq!(plan_order(&hosts, true, 0), vec![0, 2, 3, 1]);
        assert_eq!(plan_order(&hosts, true, 1), vec![2, 3, 0, 1]);
        assert_eq!(plan_order(&hosts, true, 5), vec![3, 0, 2, 1]);
    }

    #[test]
    fn test_down_hosts_are_tried_last() {
        let hosts = [(Local, false), (Local, true), (Remote, true)];
        assert_eq!(plan_order(&hosts, false, 0), vec![1, 2, 0]);
    }

    #[test]
    fn test_remote_only_cluster() {
        let hosts = [(Remote, true), (Remote, true)];
        assert_eq!(plan_order(&hosts, true, 3), vec![0, 1]);
    }
}
