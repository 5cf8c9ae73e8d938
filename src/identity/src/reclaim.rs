//! Identifier reclamation.
//!
//! Freeing an identifier touches three stores in a fixed order:
//!
//! 1. the user record (the durability boundary: once written, the identifier
//!    is free),
//! 2. the reverse-lookup row of each freed value,
//! 3. the search index projection.
//!
//! Steps 2 and 3 are best effort. Their failures are reported as
//! [`Degradation`]s and never undo step 1. A failed lookup delete is handed
//! to the [`LookupReconciler`](crate::reconcile::LookupReconciler) through
//! the cleanup queue.
//!
//! Requests for the same user are serialized from the fetch through the
//! primary write; requests for different users run in parallel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::config::Configuration;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::{IdentityError, IdentityResult};
use crate::lookup::{self, LookupKey};
use crate::model::{FreeUpPlan, FreedIdentifier, IdentifierKind, UserIdentityRecord};
use crate::search::SearchIndex;
use crate::store::{RecordStore, id_key};

/// Stand-in deadline for request budgets too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Progress of one free-up request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ReclaimStage {
    Fetched,
    Computed,
    PrimaryWritten,
    LookupsCleared,
    IndexSynced,
    Done,
}

impl fmt::Display for ReclaimStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReclaimStage::Fetched => "fetch",
            ReclaimStage::Computed => "compute",
            ReclaimStage::PrimaryWritten => "primary write",
            ReclaimStage::LookupsCleared => "lookup cleanup",
            ReclaimStage::IndexSynced => "index sync",
            ReclaimStage::Done => "completion",
        };
        f.write_str(name)
    }
}

/// Tables, index and timeouts used by the reclamation protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimSettings {
    pub keyspace: String,
    pub user_table: String,
    pub lookup_table: String,
    pub index: String,
    pub index_timeout: Duration,
    pub request_timeout: Duration,
}

impl ReclaimSettings {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            keyspace: config.reclamation.keyspace.clone(),
            user_table: config.reclamation.user_table.clone(),
            lookup_table: config.reclamation.lookup_table.clone(),
            index: config.search.index.clone(),
            index_timeout: config.search.timeout,
            request_timeout: config.reclamation.request_timeout,
        }
    }
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self::from_config(&Configuration::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeUpRequest {
    pub user_id: String,
    pub kinds: Vec<IdentifierKind>,
    /// Overrides the configured request timeout.
    pub deadline: Option<Duration>,
}

impl FreeUpRequest {
    pub fn new(user_id: impl Into<String>, kinds: impl IntoIterator<Item = IdentifierKind>) -> Self {
        Self {
            user_id: user_id.into(),
            kinds: kinds.into_iter().collect(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A best-effort step that did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    LookupCleanupFailed { lookup: String, reason: String },
    IndexSyncFailed { reason: String },
    IndexDocumentMissing,
    IndexSyncTimedOut { after_ms: u64 },
    /// The request deadline passed before the stage could run.
    Abandoned { stage: ReclaimStage },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::LookupCleanupFailed { lookup, reason } => {
                write!(f, "lookup row {lookup} not deleted: {reason}")
            }
            Degradation::IndexSyncFailed { reason } => write!(f, "index update failed: {reason}"),
            Degradation::IndexDocumentMissing => f.write_str("index document does not exist"),
            Degradation::IndexSyncTimedOut { after_ms } => {
                write!(f, "index update not acknowledged after {after_ms}ms")
            }
            Degradation::Abandoned { stage } => write!(f, "{stage} abandoned at deadline"),
        }
    }
}

/// Result of a successful free-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreeUpOutcome {
    pub user_id: String,
    pub freed: Vec<FreedIdentifier>,
    pub degradations: Vec<Degradation>,
}

impl FreeUpOutcome {
    /// Nothing was bound, so nothing was written.
    pub fn is_noop(&self) -> bool {
        self.freed.is_empty()
    }

    /// The primary write succeeded but a downstream step degraded.
    pub fn is_partially_consistent(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Per-user async locks; entries are dropped once nobody holds or waits.
#[derive(Debug, Default)]
struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    async fn lock(&self, user_id: &str) -> UserLockGuard<'_> {
        let mutex = self
            .locks
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        // Built before waiting so a cancelled waiter still releases the entry.
        let mut guard = UserLockGuard {
            locks: self,
            user_id: user_id.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct UserLockGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.user_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Frees bound identifiers of user records.
pub struct IdentifierReclaimer {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    settings: ReclaimSettings,
    locks: UserLocks,
    cleanup: Option<mpsc::Sender<LookupKey>>,
}

impl IdentifierReclaimer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        settings: ReclaimSettings,
    ) -> Self {
        Self {
            store,
            index,
            settings,
            locks: UserLocks::default(),
            cleanup: None,
        }
    }

    /// Send lookup keys whose delete failed to `queue`.
    pub fn with_cleanup_queue(mut self, queue: mpsc::Sender<LookupKey>) -> Self {
        self.cleanup = Some(queue);
        self
    }

    pub fn settings(&self) -> &ReclaimSettings {
        &self.settings
    }

    /// Free the identifiers of `request.kinds` bound to `request.user_id`.
    pub async fn free_up(&self, request: FreeUpRequest) -> IdentityResult<FreeUpOutcome> {
        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(IdentityError::InvalidRequest("user id is required".into()));
        }
        if request.kinds.is_empty() {
            return Err(IdentityError::InvalidRequest(
                "at least one identifier kind is required".into(),
            ));
        }
        let budget = request.deadline.unwrap_or(self.settings.request_timeout);
        let now = Instant::now();
        let deadline = now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE);

        let plan = self.write_primary(&user_id, &request.kinds, deadline).await?;
        if plan.is_empty() {
            tracing::info!(user_id = %user_id, "Identifiers already free; nothing to do");
            return Ok(FreeUpOutcome {
                user_id,
                freed: Vec::new(),
                degradations: Vec::new(),
            });
        }

        let mut degradations = self.clear_lookups(&user_id, &plan.freed, deadline).await;
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::LookupsCleared);

        if let Some(degradation) = self.sync_index(&user_id, &plan.projection, deadline).await {
            degradations.push(degradation);
        }
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::IndexSynced);

        let freed: Vec<&str> = plan.freed.iter().map(|f| f.kind.as_str()).collect();
        if degradations.is_empty() {
            tracing::info!(user_id = %user_id, freed = ?freed, "Identifiers freed");
        } else {
            tracing::warn!(
                user_id = %user_id,
                freed = ?freed,
                degradations = %degradations.len(),
                "Identifiers freed with degraded downstream consistency"
            );
        }
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::Done);

        Ok(FreeUpOutcome {
            user_id,
            freed: plan.freed,
            degradations,
        })
    }

    /// Fetch, compute and write the user record under the user's lock.
    async fn write_primary(
        &self,
        user_id: &str,
        kinds: &[IdentifierKind],
        deadline: Instant,
    ) -> IdentityResult<FreeUpPlan> {
        let settings = &self.settings;
        let _guard = timeout_at(deadline, self.locks.lock(user_id))
            .await
            .map_err(|_| IdentityError::DeadlineExceeded(ReclaimStage::Fetched))?;

        let row = timeout_at(
            deadline,
            self.store
                .get_by_id(&settings.keyspace, &settings.user_table, user_id),
        )
        .await
        .map_err(|_| IdentityError::DeadlineExceeded(ReclaimStage::Fetched))??
        .ok_or_else(|| IdentityError::NotFound(format!("user {user_id}")))?;
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::Fetched);

        let mut record = UserIdentityRecord::from_row(row)?;
        let plan = FreeUpPlan::compute(&mut record, kinds);
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::Computed, freed = plan.freed.len());
        if plan.is_empty() {
            return Ok(plan);
        }

        // A write already issued is never cancelled, so the deadline is only
        // checked before it.
        if Instant::now() >= deadline {
            return Err(IdentityError::DeadlineExceeded(ReclaimStage::PrimaryWritten));
        }
        self.store
            .put(
                &settings.keyspace,
                &settings.user_table,
                &id_key(user_id),
                &plan.changes,
            )
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Primary write failed");
                match e {
                    IdentityError::Server(_) => e,
                    other => IdentityError::Server(other.to_string()),
                }
            })?;
        tracing::debug!(user_id = %user_id, stage = %ReclaimStage::PrimaryWritten);
        Ok(plan)
    }

    async fn clear_lookups(
        &self,
        user_id: &str,
        freed: &[FreedIdentifier],
        deadline: Instant,
    ) -> Vec<Degradation> {
        let mut degradations = Vec::new();
        for (position, identifier) in freed.iter().enumerate() {
            let key = LookupKey::from(identifier);
            // `timeout_at` still completes a ready future past the deadline.
            let cleared = if Instant::now() < deadline {
                timeout_at(deadline, self.clear_lookup(user_id, &key))
                    .await
                    .ok()
            } else {
                None
            };
            match cleared {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    tracing::warn!(user_id = %user_id, lookup = %key, error = %e, "Lookup row not deleted");
                    degradations.push(Degradation::LookupCleanupFailed {
                        lookup: key.to_string(),
                        reason: e.to_string(),
                    });
                    self.schedule_cleanup(key);
                }
                None => {
                    tracing::warn!(user_id = %user_id, "Deadline reached during lookup cleanup");
                    degradations.push(Degradation::Abandoned {
                        stage: ReclaimStage::LookupsCleared,
                    });
                    for rest in &freed[position..] {
                        self.schedule_cleanup(LookupKey::from(rest));
                    }
                    break;
                }
            }
        }
        degradations
    }

    /// Delete the lookup row of `key` unless it already belongs to someone
    /// else.
    async fn clear_lookup(&self, user_id: &str, key: &LookupKey) -> IdentityResult<()> {
        let settings = &self.settings;
        let row_key = key.to_row();
        let Some(row) = self
            .store
            .get(&settings.keyspace, &settings.lookup_table, &row_key)
            .await?
        else {
            return Ok(());
        };
        if let Some(owner) = lookup::owner(&row) {
            if owner != user_id {
                tracing::debug!(lookup = %key, owner, "Lookup row already rebound; leaving it");
                return Ok(());
            }
        }
        let deleted = self
            .store
            .delete_if(
                &settings.keyspace,
                &settings.lookup_table,
                &row_key,
                &lookup::owner_unchanged(&row),
            )
            .await?;
        if !deleted {
            tracing::debug!(lookup = %key, "Lookup row rebound before delete; leaving it");
        }
        Ok(())
    }

    fn schedule_cleanup(&self, key: LookupKey) {
        let Some(queue) = &self.cleanup else {
            return;
        };
        match queue.try_send(key) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(key)) => {
                tracing::warn!(lookup = %key, "Cleanup queue full; leaving the row to the sweep");
            }
            Err(mpsc::error::TrySendError::Closed(key)) => {
                tracing::debug!(lookup = %key, "Cleanup queue closed");
            }
        }
    }

    async fn sync_index(
        &self,
        user_id: &str,
        projection: &cluster::Row,
        deadline: Instant,
    ) -> Option<Degradation> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Some(Degradation::Abandoned {
                stage: ReclaimStage::IndexSynced,
            });
        }
        let wait = remaining.min(self.settings.index_timeout);

        let update = self.index.update(&self.settings.index, user_id, projection);
        let degradation = match timeout(wait, update).await {
            Ok(Ok(true)) => return None,
            Ok(Ok(false)) => Degradation::IndexDocumentMissing,
            Ok(Err(e)) => Degradation::IndexSyncFailed {
                reason: e.to_string(),
            },
            Err(_) => Degradation::IndexSyncTimedOut {
                after_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            },
        };
        tracing::warn!(user_id = %user_id, "Search index out of sync: {degradation}");
        Some(degradation)
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}
