//! Stale-claim recovery.
//!
//! An invocation that dies mid-chunk leaves its items in `processing`. The
//! next invocation hands them back to the queue, or fails them when the lost
//! claim was their last allowed attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::queue::{QueueStore, StaleRecovery};

use super::config::STALE_RECOVERY_MARKER;

/// Recover `processing` items whose `started_at` is older than `threshold`.
///
/// Runs at the start of every invocation. A failure here is logged and the
/// invocation carries on; the next invocation will try again.
pub async fn recover_stale<S>(
    store: &S,
    threshold: Duration,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> StaleRecovery
where
    S: QueueStore + ?Sized,
{
    let Some(cutoff) = chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|t| now.checked_sub_signed(t))
    else {
        warn!(?threshold, "stale threshold out of range, skipping recovery");
        return StaleRecovery::default();
    };

    match store
        .recover_stale(cutoff, max_attempts, STALE_RECOVERY_MARKER)
        .await
    {
        Ok(recovery) if recovery.total() == 0 => recovery,
        Ok(recovery) => {
            info!(
                requeued = recovery.requeued,
                failed = recovery.failed,
                %cutoff,
                "recovered stale processing items"
            );
            recovery
        }
        Err(e) => {
            warn!(error = %e, "stale recovery failed");
            StaleRecovery::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ClaimOutcome, ClaimRequest, InMemoryStore};
    use enrichq_core::{ItemStatus, QueueItem, QueueItemId, TargetId};

    async fn claim_one(store: &InMemoryStore) -> QueueItemId {
        let ClaimOutcome::Claimed(claimed) = store
            .claim_batch(ClaimRequest { batch_size: 1, max_attempts: 3 })
            .await
            .unwrap()
        else {
            panic!("atomic claim expected");
        };
        let id = claimed[0].id;
        store.set_started_at(id, Some(Utc::now() - chrono::Duration::minutes(11)));
        id
    }

    #[tokio::test]
    async fn frozen_item_is_pending_again_after_one_pass() {
        let store = InMemoryStore::new();
        store.insert(QueueItem::new(TargetId::new(), false, Utc::now()));
        let id = claim_one(&store).await;

        let recovery = recover_stale(&store, Duration::from_secs(600), 3, Utc::now()).await;
        assert_eq!(recovery, StaleRecovery { requeued: 1, failed: 0 });

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.started_at, None);
        assert_eq!(item.last_error.as_deref(), Some(STALE_RECOVERY_MARKER));
    }

    #[tokio::test]
    async fn frozen_item_on_its_last_attempt_is_failed() {
        let store = InMemoryStore::new();
        let mut item = QueueItem::new(TargetId::new(), false, Utc::now());
        item.attempts = 2;
        store.insert(item);
        let id = claim_one(&store).await;

        let recovery = recover_stale(&store, Duration::from_secs(600), 3, Utc::now()).await;
        assert_eq!(recovery, StaleRecovery { requeued: 0, failed: 1 });

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert_eq!(item.last_error.as_deref(), Some(STALE_RECOVERY_MARKER));
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let recovery = recover_stale(&store, Duration::from_secs(600), 3, Utc::now()).await;
        assert_eq!(recovery, StaleRecovery::default());
    }
}
