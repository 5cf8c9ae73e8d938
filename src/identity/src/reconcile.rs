//! Removal of stale reverse-lookup rows.
//!
//! A lookup row is stale when its owner record is gone or no longer has the
//! value bound to that kind. Such rows are left behind when a lookup delete
//! fails after the user record was written.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::IdentityResult;
use crate::lookup::{self, LookupKey};
use crate::model::UserIdentityRecord;
use crate::reclaim::ReclaimSettings;
use crate::store::RecordStore;

/// Counts from one sweep over the lookup table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Longest wait between two attempts of a queued lookup delete.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub struct LookupReconciler {
    store: Arc<dyn RecordStore>,
    keyspace: String,
    user_table: String,
    lookup_table: String,
    retry_backoff: Duration,
    retry_attempts: u32,
}

impl LookupReconciler {
    pub fn new(store: Arc<dyn RecordStore>, settings: &ReclaimSettings) -> Self {
        Self {
            store,
            keyspace: settings.keyspace.clone(),
            user_table: settings.user_table.clone(),
            lookup_table: settings.lookup_table.clone(),
            retry_backoff: Duration::from_secs(1),
            retry_attempts: 5,
        }
    }

    /// Re-attempt failed queued retries after `backoff`, doubling per
    /// attempt, for at most `attempts` attempts in total.
    pub fn with_retry_backoff(mut self, backoff: Duration, attempts: u32) -> Self {
        self.retry_backoff = backoff;
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Wait after the failed attempt number `attempt` (1-based).
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    async fn is_stale(&self, key: &LookupKey, owner: Option<&str>) -> IdentityResult<bool> {
        let Some(owner) = owner else {
            return Ok(true);
        };
        let Some(row) = self
            .store
            .get_by_id(&self.keyspace, &self.user_table, owner)
            .await?
        else {
            return Ok(true);
        };
        let record = UserIdentityRecord::from_row(row)?;
        Ok(record.identifier(key.kind) != Some(key.value.as_str()))
    }

    /// Re-read the lookup row of `key` and delete it if stale. Returns
    /// whether a row was removed.
    pub async fn retry(&self, key: &LookupKey) -> IdentityResult<bool> {
        let row_key = key.to_row();
        let Some(row) = self
            .store
            .get(&self.keyspace, &self.lookup_table, &row_key)
            .await?
        else {
            return Ok(false);
        };
        if !self.is_stale(key, lookup::owner(&row)).await? {
            return Ok(false);
        }
        let removed = self
            .store
            .delete_if(
                &self.keyspace,
                &self.lookup_table,
                &row_key,
                &lookup::owner_unchanged(&row),
            )
            .await?;
        if removed {
            log::info!("Removed stale lookup row {key}");
        } else {
            log::debug!("Lookup row {key} changed owner before removal; kept");
        }
        Ok(removed)
    }

    /// Scan the lookup table once and delete every stale row.
    pub async fn reconcile_once(&self) -> IdentityResult<SweepReport> {
        let rows = self
            .store
            .get_all(&self.keyspace, &self.lookup_table)
            .await?;
        let mut report = SweepReport::default();
        for row in rows {
            report.scanned += 1;
            let Some(key) = LookupKey::from_row(&row) else {
                log::warn!("Skipping malformed lookup row {row:?}");
                report.failed += 1;
                continue;
            };
            // Candidates are checked again against a fresh read in `retry`.
            match self.retry(&key).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to reconcile lookup row {key}: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Attempt number `attempt` of a queued retry; schedules the next one on
    /// failure until the attempts run out.
    async fn attempt(
        &self,
        key: LookupKey,
        attempt: u32,
        backoff: &mut JoinSet<(LookupKey, u32)>,
    ) {
        let Err(e) = self.retry(&key).await else {
            return;
        };
        if attempt >= self.retry_attempts {
            log::warn!(
                "Giving up on lookup row {key} after {attempt} attempts, leaving it to the sweep: {e}"
            );
            return;
        }
        let delay = self.retry_delay(attempt);
        log::warn!("Retry of lookup row {key} failed, next attempt in {delay:?}: {e}");
        backoff.spawn(async move {
            tokio::time::sleep(delay).await;
            (key, attempt + 1)
        });
    }

    /// Drive `retries` and, when `sweep_interval` is set, a periodic sweep
    /// whose first run is one interval after start. The task ends once the
    /// retry queue is closed, no retry is waiting out its backoff and no
    /// sweep is scheduled.
    pub fn spawn(
        self: Arc<Self>,
        sweep_interval: Option<Duration>,
        mut retries: mpsc::Receiver<LookupKey>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = sweep_interval.map(|period| {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            let mut backoff = JoinSet::new();
            let mut retries_open = true;

            loop {
                if !retries_open && ticker.is_none() && backoff.is_empty() {
                    break;
                }
                tokio::select! {
                    key = retries.recv(), if retries_open => match key {
                        Some(key) => self.attempt(key, 1, &mut backoff).await,
                        None => retries_open = false,
                    },
                    Some(delayed) = backoff.join_next(), if !backoff.is_empty() => match delayed {
                        Ok((key, attempt)) => self.attempt(key, attempt, &mut backoff).await,
                        Err(e) => log::error!("Delayed lookup retry failed to run: {e}"),
                    },
                    _ = next_tick(&mut ticker) => match self.reconcile_once().await {
                        Ok(report) if report.removed > 0 || report.failed > 0 => {
                            log::info!("Lookup sweep: {report:?}");
                        }
                        Ok(report) => log::debug!("Lookup sweep: {report:?}"),
                        Err(e) => log::error!("Lookup sweep failed: {e}"),
                    },
                }
            }
            log::debug!("Lookup reconciler stopped");
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdentityError;
    use crate::store::MockRecordStore;
    use cluster::{Row, row};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lookup_row(kind: &str, value: &str, owner: &str) -> Row {
        row([
            ("type", json!(kind)),
            ("value", json!(value)),
            ("userId", json!(owner)),
        ])
    }

    fn reconciler(store: MockRecordStore) -> LookupReconciler {
        LookupReconciler::new(Arc::new(store), &ReclaimSettings::default())
    }

    #[tokio::test]
    async fn test_retry_keeps_row_of_bound_value() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .returning(|_, _, _| Ok(Some(lookup_row("email", "a@x.com", "u1"))));
        store.expect_get_by_id().returning(|_, _, _| {
            Ok(Some(row([("id", json!("u1")), ("email", json!("a@x.com"))])))
        });
        store.expect_delete_if().never();

        let key = LookupKey::new(crate::model::IdentifierKind::Email, "a@x.com");
        assert!(!reconciler(store).retry(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_removes_row_of_freed_value() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .returning(|_, _, _| Ok(Some(lookup_row("email", "a@x.com", "u1"))));
        store.expect_get_by_id().returning(|_, _, _| {
            Ok(Some(row([("id", json!("u1")), ("prevUsedEmail", json!("a@x.com"))])))
        });
        store
            .expect_delete_if()
            .times(1)
            .withf(|_, _, _, expected| expected == &row([("userId", json!("u1"))]))
            .returning(|_, _, _, _| Ok(true));

        let key = LookupKey::new(crate::model::IdentifierKind::Email, "a@x.com");
        assert!(reconciler(store).retry(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_keeps_row_rebound_after_read() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .returning(|_, _, _| Ok(Some(lookup_row("email", "a@x.com", "u1"))));
        store.expect_get_by_id().returning(|_, _, _| {
            Ok(Some(row([("id", json!("u1")), ("prevUsedEmail", json!("a@x.com"))])))
        });
        store.expect_delete().never();
        // The row now names another owner, so the owner condition misses.
        store
            .expect_delete_if()
            .times(1)
            .returning(|_, _, _, _| Ok(false));

        let key = LookupKey::new(crate::model::IdentifierKind::Email, "a@x.com");
        assert!(!reconciler(store).retry(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_counts_removed_and_failed_rows() {
        let mut store = MockRecordStore::new();
        store.expect_get_all().returning(|_, _| {
            Ok(vec![
                lookup_row("email", "a@x.com", "u1"),
                lookup_row("phone", "123", "gone"),
                row([("type", json!("fax")), ("value", json!("1"))]),
            ])
        });
        store.expect_get().returning(|_, _, key| {
            let kind = key["type"].as_str().unwrap_or_default();
            let value = key["value"].as_str().unwrap_or_default();
            let owner = if kind == "email" { "u1" } else { "gone" };
            Ok(Some(lookup_row(kind, value, owner)))
        });
        store.expect_get_by_id().returning(|_, _, id| {
            if id == "u1" {
                Ok(Some(row([("id", json!("u1")), ("email", json!("a@x.com"))])))
            } else {
                Ok(None)
            }
        });
        store
            .expect_delete_if()
            .times(1)
            .withf(|_, _, key, _| key.get("value") == Some(&json!("123")))
            .returning(|_, _, _, _| Ok(true));

        let report = reconciler(store).reconcile_once().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                removed: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_fails_when_table_is_unreadable() {
        let mut store = MockRecordStore::new();
        store
            .expect_get_all()
            .returning(|_, _| Err(IdentityError::Server("unavailable".into())));

        assert!(reconciler(store).reconcile_once().await.is_err());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_when_queue_closes() {
        let mut store = MockRecordStore::new();
        store.expect_get().times(1).returning(|_, _, _| Ok(None));

        let (tx, rx) = mpsc::channel(4);
        let handle = Arc::new(reconciler(store)).spawn(None, rx);
        tx.send(LookupKey::new(crate::model::IdentifierKind::Phone, "123"))
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler stops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_retry_is_attempted_again_after_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut store = MockRecordStore::new();
        let counter = attempts.clone();
        store.expect_get().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IdentityError::Server("unavailable".into()))
            } else {
                Ok(None)
            }
        });

        let reconciler = reconciler(store).with_retry_backoff(Duration::from_millis(10), 5);
        let (tx, rx) = mpsc::channel(4);
        let handle = Arc::new(reconciler).spawn(None, rx);
        tx.send(LookupKey::new(crate::model::IdentifierKind::Phone, "123"))
            .await
            .unwrap();
        drop(tx);

        // The task outlives the closed queue until the last delayed attempt ran.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler stops")
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_configured_attempts() {
        let mut store = MockRecordStore::new();
        store
            .expect_get()
            .times(2)
            .returning(|_, _, _| Err(IdentityError::Server("unavailable".into())));

        let reconciler = reconciler(store).with_retry_backoff(Duration::from_millis(5), 2);
        let (tx, rx) = mpsc::channel(4);
        let handle = Arc::new(reconciler).spawn(None, rx);
        tx.send(LookupKey::new(crate::model::IdentifierKind::Email, "a@x.com"))
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler stops")
            .unwrap();
    }

    #[test]
    fn test_retry_delay_doubles_up_to_the_cap() {
        let reconciler = reconciler(MockRecordStore::new())
            .with_retry_backoff(Duration::from_millis(100), 40);
        assert_eq!(reconciler.retry_delay(1), Duration::from_millis(100));
        assert_eq!(reconciler.retry_delay(2), Duration::from_millis(200));
        assert_eq!(reconciler.retry_delay(4), Duration::from_millis(800));
        assert_eq!(reconciler.retry_delay(40), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_first_sweep_waits_one_interval() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let mut store = MockRecordStore::new();
        let counter = sweeps.clone();
        store.expect_get_all().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        });

        let (_tx, rx) = mpsc::channel(4);
        let handle = Arc::new(reconciler(store)).spawn(Some(Duration::from_millis(300)), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(sweeps.load(Ordering::SeqCst) >= 1);
        handle.abort();
    }
}
