//! Already-enriched short-circuit.

use std::collections::HashSet;

use tracing::{debug, warn};

use enrichq_core::{QueueItem, TargetId};
use enrichq_pipeline::TargetLookup;

use crate::queue::QueueStore;

/// A claimed batch split into items to dispatch and items whose targets
/// already carry enrichment evidence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SkipPartition {
    /// Claim order preserved.
    pub to_process: Vec<QueueItem>,
    pub satisfied: Vec<QueueItem>,
}

/// Split `batch`. Forced items are always processed, and so is everything
/// when the target lookup fails.
pub async fn partition_satisfied<L>(lookup: &L, batch: Vec<QueueItem>) -> SkipPartition
where
    L: TargetLookup + ?Sized,
{
    let unforced: Vec<TargetId> = batch.iter().filter(|i| !i.force).map(|i| i.target_id).collect();
    if unforced.is_empty() {
        return SkipPartition { to_process: batch, satisfied: Vec::new() };
    }

    let evidenced: HashSet<TargetId> = match lookup.load_targets(&unforced).await {
        Ok(records) => records
            .into_iter()
            .filter(|r| r.has_enrichment_evidence())
            .map(|r| r.id)
            .collect(),
        Err(e) => {
            warn!(error = %e, "target lookup failed, processing the whole batch");
            HashSet::new()
        }
    };

    let (satisfied, to_process) = batch
        .into_iter()
        .partition(|i| !i.force && evidenced.contains(&i.target_id));
    SkipPartition { to_process, satisfied }
}

/// Mark satisfied items `completed`. Returns the ones this invocation
/// actually completed (the rest lost a race or hit a store error).
pub async fn complete_satisfied<S>(store: &S, satisfied: Vec<QueueItem>) -> Vec<QueueItem>
where
    S: QueueStore + ?Sized,
{
    let mut completed = Vec::with_capacity(satisfied.len());
    for item in satisfied {
        match store.complete(item.id, item.attempts).await {
            Ok(true) => {
                debug!(item_id = %item.id, target_id = %item.target_id, "target already enriched, skipped");
                completed.push(item);
            }
            Ok(false) => debug!(item_id = %item.id, "skip race lost"),
            Err(e) => warn!(item_id = %item.id, error = %e, "failed to mark skipped item completed"),
        }
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use enrichq_pipeline::{InMemoryTargets, PipelineError, TargetRecord};
    use serde_json::json;

    struct BrokenLookup;

    #[async_trait::async_trait]
    impl TargetLookup for BrokenLookup {
        async fn load_targets(&self, _ids: &[TargetId]) -> Result<Vec<TargetRecord>, PipelineError> {
            Err(PipelineError::Transport("connection refused".to_string()))
        }
    }

    fn enriched_target(targets: &InMemoryTargets) -> TargetId {
        let id = TargetId::new();
        targets.upsert(
            TargetRecord::new(id)
                .with_enriched_at(Utc::now())
                .with_field("summary", json!("Acme makes anvils")),
        );
        id
    }

    #[tokio::test]
    async fn evidenced_targets_are_skipped_unless_forced() {
        let targets = InMemoryTargets::new();
        let done = enriched_target(&targets);
        let half_done = TargetId::new();
        targets.upsert(TargetRecord::new(half_done).with_enriched_at(Utc::now()));

        let skip = QueueItem::new(done, false, Utc::now());
        let forced = QueueItem::new(done, true, Utc::now());
        let partial = QueueItem::new(half_done, false, Utc::now());
        let unknown = QueueItem::new(TargetId::new(), false, Utc::now());

        let partition =
            partition_satisfied(&targets, vec![skip.clone(), forced.clone(), partial.clone(), unknown.clone()]).await;

        assert_eq!(partition.satisfied, vec![skip]);
        assert_eq!(partition.to_process, vec![forced, partial, unknown]);
    }

    #[tokio::test]
    async fn lookup_failure_processes_everything() {
        let batch = vec![
            QueueItem::new(TargetId::new(), false, Utc::now()),
            QueueItem::new(TargetId::new(), false, Utc::now()),
        ];
        let partition = partition_satisfied(&BrokenLookup, batch.clone()).await;
        assert!(partition.satisfied.is_empty());
        assert_eq!(partition.to_process, batch);
    }
}
