//! In-memory store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use enrichq_core::{
    ItemStatus, JobRun, JobRunId, OperationState, ProgressDelta, QueueItem, QueueItemId, TargetId,
};

use super::store::{JobRunStore, OperationStore, QueueStore};
use super::types::{ClaimOutcome, ClaimRequest, QueueStats, QueueStoreError, StaleRecovery};

/// In-memory implementation of every store contract.
///
/// Each operation takes the relevant lock once, so the atomic claim and the
/// conditional writes behave like single-statement updates in a database.
#[derive(Debug)]
pub struct InMemoryStore {
    items: RwLock<HashMap<QueueItemId, QueueItem>>,
    operations: RwLock<HashMap<String, OperationState>>,
    runs: RwLock<HashMap<JobRunId, JobRun>>,
    atomic_claim: bool,
    unavailable: AtomicBool,
    runs_unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            atomic_claim: true,
            unavailable: AtomicBool::new(false),
            runs_unavailable: AtomicBool::new(false),
        }
    }

    /// A store without the atomic claim primitive, forcing the fallback path.
    pub fn without_atomic_claim() -> Self {
        Self {
            atomic_claim: false,
            ..Self::new()
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed item (seeding with specific timestamps or status).
    pub fn insert(&self, item: QueueItem) {
        write(&self.items).insert(item.id, item);
    }

    /// Overwrite `started_at` of an item, e.g. to simulate a crashed invocation.
    pub fn set_started_at(&self, id: QueueItemId, started_at: Option<DateTime<Utc>>) {
        if let Some(item) = write(&self.items).get_mut(&id) {
            item.started_at = started_at;
        }
    }

    /// Every item, oldest-enqueued first.
    pub fn items(&self) -> Vec<QueueItem> {
        let mut all: Vec<_> = read(&self.items).values().cloned().collect();
        all.sort_by_key(|i| (i.queued_at, i.id));
        all
    }

    pub fn runs(&self) -> Vec<JobRun> {
        let mut all: Vec<_> = read(&self.runs).values().cloned().collect();
        all.sort_by_key(|r| (r.started_at, r.id));
        all
    }

    /// Make queue-table operations fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make job-run writes fail.
    pub fn set_job_runs_unavailable(&self, unavailable: bool) {
        self.runs_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueStoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn check_runs_available(&self) -> Result<(), QueueStoreError> {
        self.check_available()?;
        if self.runs_unavailable.load(Ordering::SeqCst) {
            return Err(QueueStoreError::Unavailable("job runs offline".to_string()));
        }
        Ok(())
    }

    /// Apply `f` to the item if it is `processing` at `attempts`.
    fn with_claimed(
        &self,
        id: QueueItemId,
        attempts: u32,
        f: impl FnOnce(&mut QueueItem) -> Result<(), enrichq_core::DomainError>,
    ) -> Result<bool, QueueStoreError> {
        self.check_available()?;
        let mut items = write(&self.items);
        match items.get_mut(&id) {
            Some(item) if item.status == ItemStatus::Processing && item.attempts == attempts => {
                f(item)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn with_operation<T>(
        &self,
        kind: &str,
        f: impl FnOnce(&mut OperationState) -> T,
    ) -> Result<T, QueueStoreError> {
        self.check_available()?;
        let mut ops = write(&self.operations);
        let op = ops
            .entry(kind.to_string())
            .or_insert_with(|| OperationState::new(kind, Utc::now()));
        Ok(f(op))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn oldest_claimable(
    items: &HashMap<QueueItemId, QueueItem>,
    limit: u32,
    max_attempts: u32,
) -> Vec<QueueItemId> {
    let mut candidates: Vec<_> = items
        .values()
        .filter(|i| i.is_claimable(max_attempts))
        .map(|i| (i.queued_at, i.id))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .take(limit as usize)
        .map(|(_, id)| id)
        .collect()
}

#[async_trait::async_trait]
impl QueueStore for InMemoryStore {
    async fn enqueue(&self, target_id: TargetId, force: bool) -> Result<QueueItem, QueueStoreError> {
        self.check_available()?;
        let item = QueueItem::new(target_id, force, Utc::now());
        let mut items = write(&self.items);
        if items.contains_key(&item.id) {
            return Err(QueueStoreError::Conflict(format!("item {} already exists", item.id)));
        }
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueStoreError> {
        self.check_available()?;
        Ok(read(&self.items).get(&id).cloned())
    }

    async fn claim_batch(&self, request: ClaimRequest) -> Result<ClaimOutcome, QueueStoreError> {
        self.check_available()?;
        if !self.atomic_claim {
            return Ok(ClaimOutcome::Unsupported);
        }

        let mut items = write(&self.items);
        let now = Utc::now();
        let mut claimed = Vec::new();
        for id in oldest_claimable(&items, request.batch_size, request.max_attempts) {
            if let Some(item) = items.get_mut(&id) {
                item.claim(now)?;
                claimed.push(item.clone());
            }
        }
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn list_pending(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        self.check_available()?;
        let items = read(&self.items);
        Ok(oldest_claimable(&items, limit, max_attempts)
            .into_iter()
            .filter_map(|id| items.get(&id).cloned())
            .collect())
    }

    async fn try_claim(
        &self,
        id: QueueItemId,
        expected_attempts: u32,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        self.check_available()?;
        let mut items = write(&self.items);
        match items.get_mut(&id) {
            Some(item) if item.status == ItemStatus::Pending && item.attempts == expected_attempts => {
                item.claim(Utc::now())?;
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn recover_stale(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
        marker: &str,
    ) -> Result<StaleRecovery, QueueStoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut items = write(&self.items);
        let mut recovery = StaleRecovery::default();
        for item in items.values_mut().filter(|i| i.is_stale(started_before)) {
            match item.reset_stale(marker, max_attempts, now)? {
                ItemStatus::Failed => recovery.failed += 1,
                _ => recovery.requeued += 1,
            }
        }
        Ok(recovery)
    }

    async fn complete(&self, id: QueueItemId, attempts: u32) -> Result<bool, QueueStoreError> {
        self.with_claimed(id, attempts, |item| item.complete(Utc::now()))
    }

    async fn release_for_retry(
        &self,
        id: QueueItemId,
        attempts: u32,
        error: &str,
        clear_started: bool,
    ) -> Result<bool, QueueStoreError> {
        self.with_claimed(id, attempts, |item| item.release_for_retry(error, clear_started))
    }

    async fn fail(&self, id: QueueItemId, attempts: u32, error: &str) -> Result<bool, QueueStoreError> {
        self.with_claimed(id, attempts, |item| item.fail(error, Utc::now()))
    }

    async fn cancel_pending(
        &self,
        before: DateTime<Utc>,
        marker: &str,
    ) -> Result<u64, QueueStoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut items = write(&self.items);
        let mut cancelled = 0;
        for item in items
            .values_mut()
            .filter(|i| i.status == ItemStatus::Pending && i.queued_at < before)
        {
            item.cancel(marker, now)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn count_pending(&self, max_attempts: u32) -> Result<u64, QueueStoreError> {
        self.check_available()?;
        Ok(read(&self.items)
            .values()
            .filter(|i| i.is_claimable(max_attempts))
            .count() as u64)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        self.check_available()?;
        let mut stats = QueueStats::default();
        for item in read(&self.items).values() {
            match item.status {
                ItemStatus::Pending => stats.pending += 1,
                ItemStatus::Processing => stats.processing += 1,
                ItemStatus::Completed => stats.completed += 1,
                ItemStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl OperationStore for InMemoryStore {
    async fn load_operation(&self, kind: &str) -> Result<Option<OperationState>, QueueStoreError> {
        self.check_available()?;
        Ok(read(&self.operations).get(kind).cloned())
    }

    async fn begin_operation(&self, kind: &str) -> Result<OperationState, QueueStoreError> {
        self.with_operation(kind, |op| {
            op.begin(Utc::now());
            op.clone()
        })
    }

    async fn record_progress(
        &self,
        kind: &str,
        delta: &ProgressDelta,
        error_cap: usize,
    ) -> Result<(), QueueStoreError> {
        self.with_operation(kind, |op| op.apply(delta, error_cap, Utc::now()))
    }

    async fn set_remaining(&self, kind: &str, remaining: u64) -> Result<(), QueueStoreError> {
        self.with_operation(kind, |op| {
            op.remaining = remaining;
            op.updated_at = Utc::now();
        })
    }

    async fn set_paused(&self, kind: &str, paused: bool) -> Result<OperationState, QueueStoreError> {
        self.with_operation(kind, |op| {
            op.paused = paused;
            op.updated_at = Utc::now();
            op.clone()
        })
    }

    async fn mark_operation_completed(&self, kind: &str) -> Result<(), QueueStoreError> {
        self.with_operation(kind, |op| op.mark_completed(Utc::now()))
    }

    async fn mark_operation_failed(&self, kind: &str, reason: &str) -> Result<(), QueueStoreError> {
        self.with_operation(kind, |op| op.mark_failed(reason, Utc::now()))
    }
}

#[async_trait::async_trait]
impl JobRunStore for InMemoryStore {
    async fn insert_run(&self, run: &JobRun) -> Result<(), QueueStoreError> {
        self.check_runs_available()?;
        let mut runs = write(&self.runs);
        if runs.contains_key(&run.id) {
            return Err(QueueStoreError::Conflict(format!("job run {} already exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), QueueStoreError> {
        self.check_runs_available()?;
        match write(&self.runs).get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(QueueStoreError::Storage(format!("job run {} not found", run.id))),
        }
    }

    async fn recent_runs(&self, kind: &str, limit: u32) -> Result<Vec<JobRun>, QueueStoreError> {
        self.check_runs_available()?;
        let mut runs: Vec<_> = read(&self.runs)
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded(store: &InMemoryStore, n: usize) -> Vec<QueueItem> {
        let base = Utc::now() - Duration::minutes(60);
        (0..n)
            .map(|i| {
                let item = QueueItem::new(TargetId::new(), false, base + Duration::seconds(i as i64));
                store.insert(item.clone());
                item
            })
            .collect()
    }

    fn request(batch_size: u32) -> ClaimRequest {
        ClaimRequest { batch_size, max_attempts: 3 }
    }

    #[tokio::test]
    async fn claim_takes_oldest_first_and_post_increments() {
        let store = InMemoryStore::new();
        let seeded = seeded(&store, 5);

        let ClaimOutcome::Claimed(claimed) = store.claim_batch(request(3)).await.unwrap() else {
            panic!("atomic claim expected");
        };
        let ids: Vec<_> = claimed.iter().map(|i| i.id).collect();
        assert_eq!(ids, seeded[..3].iter().map(|i| i.id).collect::<Vec<_>>());
        assert!(claimed.iter().all(|i| i.attempts == 1 && i.started_at.is_some()));
        assert_eq!(store.count_pending(3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_skips_exhausted_items() {
        let store = InMemoryStore::new();
        let mut item = QueueItem::new(TargetId::new(), false, Utc::now());
        item.attempts = 3;
        store.insert(item);

        let outcome = store.claim_batch(request(10)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed(vec![]));
        assert_eq!(store.count_pending(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn try_claim_loses_when_attempts_moved() {
        let store = InMemoryStore::without_atomic_claim();
        let item = seeded(&store, 1).remove(0);

        assert_eq!(store.claim_batch(request(1)).await.unwrap(), ClaimOutcome::Unsupported);
        let first = store.try_claim(item.id, 0).await.unwrap();
        assert!(first.is_some());
        // A second caller that read the same candidate loses.
        assert!(store.try_claim(item.id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_writes_require_current_claim() {
        let store = InMemoryStore::new();
        seeded(&store, 1);
        let ClaimOutcome::Claimed(claimed) = store.claim_batch(request(1)).await.unwrap() else {
            panic!("atomic claim expected");
        };
        let item = &claimed[0];

        // Wrong attempts value: someone else's claim.
        assert!(!store.complete(item.id, item.attempts + 1).await.unwrap());
        assert!(store.complete(item.id, item.attempts).await.unwrap());
        // Already completed.
        assert!(!store.fail(item.id, item.attempts, "late").await.unwrap());

        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn recover_stale_only_touches_old_processing_items() {
        let store = InMemoryStore::new();
        seeded(&store, 2);
        let ClaimOutcome::Claimed(claimed) = store.claim_batch(request(2)).await.unwrap() else {
            panic!("atomic claim expected");
        };
        store.set_started_at(claimed[0].id, Some(Utc::now() - Duration::minutes(30)));

        let cutoff = Utc::now() - Duration::minutes(10);
        let recovery = store.recover_stale(cutoff, 3, "recovered").await.unwrap();
        assert_eq!(recovery, StaleRecovery { requeued: 1, failed: 0 });

        let reset = store.get(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(reset.status, ItemStatus::Pending);
        assert_eq!(reset.started_at, None);
        assert_eq!(reset.last_error.as_deref(), Some("recovered"));
        assert_eq!(reset.attempts, 1);

        let fresh = store.get(claimed[1].id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ItemStatus::Processing);
    }

    #[tokio::test]
    async fn recover_stale_fails_items_on_their_last_attempt() {
        let store = InMemoryStore::new();
        let mut item = seeded(&store, 1).remove(0);
        item.attempts = 2;
        store.insert(item.clone());
        let ClaimOutcome::Claimed(claimed) = store.claim_batch(request(1)).await.unwrap() else {
            panic!("atomic claim expected");
        };
        assert_eq!(claimed[0].attempts, 3);
        store.set_started_at(item.id, Some(Utc::now() - Duration::minutes(30)));

        let cutoff = Utc::now() - Duration::minutes(10);
        let recovery = store.recover_stale(cutoff, 3, "recovered").await.unwrap();

        assert_eq!(recovery, StaleRecovery { requeued: 0, failed: 1 });
        let stored = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("recovered"));
        assert!(stored.completed_at.is_some());
        assert_eq!(store.count_pending(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.claim_batch(request(1)).await,
            Err(QueueStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn progress_is_accumulated_per_kind() {
        let store = InMemoryStore::new();
        store.begin_operation("enrichment").await.unwrap();
        store
            .record_progress(
                "enrichment",
                &ProgressDelta { completed: 2, failed: 1, errors: vec![] },
                20,
            )
            .await
            .unwrap();

        let op = store.load_operation("enrichment").await.unwrap().unwrap();
        assert_eq!((op.completed_count, op.failed_count), (2, 1));
        assert!(store.load_operation("other").await.unwrap().is_none());
    }
}
