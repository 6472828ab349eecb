//! Long-lived queue worker.
//!
//! Drives the controller in a loop inside one process instead of
//! re-triggering it over HTTP. The continuation ceiling and the breaker delay
//! still apply: the loop follows the controller's [`ContinuationPlan`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::controller::{ContinuationPlan, Controller};
use crate::queue::ControllerStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Wait before polling again when there is no work.
    pub idle_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(15),
            name: "enrichq-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Why the worker loop ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    /// Backlog remained after the maximum number of continuations.
    CeilingReached { remaining: u64 },
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// An invocation already in progress finishes first.
    pub async fn shutdown(self) -> WorkerExit {
        let _ = self.shutdown.send(true);
        self.join.await.unwrap_or(WorkerExit::Shutdown)
    }

    /// Wait for the worker to stop on its own.
    pub async fn join(self) -> WorkerExit {
        self.join.await.unwrap_or(WorkerExit::Shutdown)
    }
}

pub struct QueueWorker<S: ?Sized> {
    controller: Arc<Controller<S>>,
    config: WorkerConfig,
}

impl<S> QueueWorker<S>
where
    S: ControllerStore + ?Sized,
{
    pub fn new(controller: Arc<Controller<S>>, config: WorkerConfig) -> Self {
        Self { controller, config }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        let name = self.config.name.as_str();
        info!(worker = name, "queue worker started");
        let mut continuation_count = 0;

        let exit = loop {
            if *shutdown.borrow() {
                break WorkerExit::Shutdown;
            }

            let wait = match self.controller.run(continuation_count).await {
                Ok(report) => match report.continuation {
                    ContinuationPlan::Continue { next_count, delay } => {
                        continuation_count = next_count;
                        delay
                    }
                    ContinuationPlan::Idle => {
                        continuation_count = 0;
                        self.config.idle_interval
                    }
                    ContinuationPlan::CeilingReached { remaining } => {
                        warn!(worker = name, remaining, "continuation ceiling reached, stopping");
                        break WorkerExit::CeilingReached { remaining };
                    }
                },
                Err(e) => {
                    error!(worker = name, error = %e, "invocation failed");
                    continuation_count = 0;
                    self.config.idle_interval
                }
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    // Handle dropped without an explicit shutdown.
                    if changed.is_err() {
                        break WorkerExit::Shutdown;
                    }
                }
            }
        };

        info!(worker = name, ?exit, "queue worker stopped");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::queue::{InMemoryStore, OperationStore, QueueStore};
    use enrichq_core::{ItemStatus, OperationStatus, TargetId};
    use enrichq_pipeline::{EnrichRequest, Enriched, EnrichmentPipeline, InMemoryTargets, PipelineError};

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl EnrichmentPipeline for AlwaysOk {
        async fn enrich(&self, _request: EnrichRequest) -> Result<Enriched, PipelineError> {
            Ok(Enriched::new(["summary"]))
        }
    }

    struct AlwaysDown;

    #[async_trait::async_trait]
    impl EnrichmentPipeline for AlwaysDown {
        async fn enrich(&self, _request: EnrichRequest) -> Result<Enriched, PipelineError> {
            Err(PipelineError::Provider("503".into()))
        }
    }

    fn controller(
        store: Arc<InMemoryStore>,
        pipeline: Arc<dyn EnrichmentPipeline>,
        config: ControllerConfig,
    ) -> Arc<Controller<InMemoryStore>> {
        Arc::new(Controller::new(store, pipeline, Arc::new(InMemoryTargets::new()), config))
    }

    #[tokio::test(start_paused = true)]
    async fn drains_backlog_across_continuations() {
        let store = Arc::new(InMemoryStore::new());
        for _ in 0..7 {
            store.enqueue(TargetId::new(), false).await.unwrap();
        }
        let config = ControllerConfig::default()
            .with_batch_size(3)
            .with_inter_chunk_delay(Duration::from_millis(10));
        let handle = QueueWorker::new(
            controller(store.clone(), Arc::new(AlwaysOk), config),
            WorkerConfig::default(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.shutdown().await, WorkerExit::Shutdown);

        assert!(store.items().iter().all(|i| i.status == ItemStatus::Completed));
        let op = store.load_operation("enrichment").await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.completed_count, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_continuation_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        for _ in 0..30 {
            store.enqueue(TargetId::new(), false).await.unwrap();
        }
        let config = ControllerConfig::default()
            .with_batch_size(1)
            .with_max_attempts(100)
            .with_max_continuations(4)
            .with_breaker_delay(Duration::from_secs(1), Duration::ZERO);
        let handle = QueueWorker::new(
            controller(store.clone(), Arc::new(AlwaysDown), config),
            WorkerConfig::default(),
        )
        .spawn();

        let exit = handle.join().await;
        assert!(matches!(exit, WorkerExit::CeilingReached { remaining } if remaining > 0));
        let op = store.load_operation("enrichment").await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
    }
}
