//! Claim protocol: atomic store primitive first, compare-and-swap fallback second.

use tracing::debug;

use enrichq_core::QueueItem;

use crate::queue::{ClaimOutcome, ClaimRequest, QueueStore, QueueStoreError};

/// Claim up to `request.batch_size` pending items, oldest first.
///
/// Returned items are already `processing` with their post-claim `attempts`.
/// An empty vector means there is no claimable work.
pub async fn claim_batch<S>(store: &S, request: ClaimRequest) -> Result<Vec<QueueItem>, QueueStoreError>
where
    S: QueueStore + ?Sized,
{
    match store.claim_batch(request).await? {
        ClaimOutcome::Claimed(items) => Ok(items),
        ClaimOutcome::Unsupported => {
            debug!("atomic claim unavailable, using compare-and-swap fallback");
            claim_with_fallback(store, request).await
        }
    }
}

/// Read candidates, then claim each one only if it is still pending at the
/// attempts value we read. Candidates another invocation got to first are
/// dropped; over-fetching is harmless.
async fn claim_with_fallback<S>(
    store: &S,
    request: ClaimRequest,
) -> Result<Vec<QueueItem>, QueueStoreError>
where
    S: QueueStore + ?Sized,
{
    let candidates = store
        .list_pending(request.batch_size, request.max_attempts)
        .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match store.try_claim(candidate.id, candidate.attempts).await? {
            Some(item) => claimed.push(item),
            None => debug!(item_id = %candidate.id, "claim race lost"),
        }
    }
    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryStore;
    use chrono::{Duration, Utc};
    use enrichq_core::{ItemStatus, TargetId};

    fn request(batch_size: u32) -> ClaimRequest {
        ClaimRequest { batch_size, max_attempts: 3 }
    }

    fn seed(store: &InMemoryStore, n: usize) -> Vec<QueueItem> {
        let base = Utc::now() - Duration::minutes(5);
        (0..n)
            .map(|i| {
                let item = QueueItem::new(TargetId::new(), false, base + Duration::seconds(i as i64));
                store.insert(item.clone());
                item
            })
            .collect()
    }

    #[tokio::test]
    async fn fallback_claims_oldest_first_with_post_increment() {
        let store = InMemoryStore::without_atomic_claim();
        let seeded = seed(&store, 4);

        let claimed = claim_batch(&store, request(3)).await.unwrap();
        assert_eq!(
            claimed.iter().map(|i| i.id).collect::<Vec<_>>(),
            seeded[..3].iter().map(|i| i.id).collect::<Vec<_>>()
        );
        for item in &claimed {
            assert_eq!(item.status, ItemStatus::Processing);
            assert_eq!(item.attempts, 1);
        }
    }

    #[tokio::test]
    async fn atomic_and_fallback_agree() {
        let atomic = InMemoryStore::new();
        let fallback = InMemoryStore::without_atomic_claim();
        for store in [&atomic, &fallback] {
            seed(store, 3);
            let claimed = claim_batch(store, request(10)).await.unwrap();
            assert_eq!(claimed.len(), 3);
            assert_eq!(store.count_pending(3).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let store = InMemoryStore::without_atomic_claim();
        assert!(claim_batch(&store, request(10)).await.unwrap().is_empty());
    }
}
