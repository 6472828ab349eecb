use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;

use enrichq_api::app::services::AppServices;
use enrichq_core::{ItemStatus, QueueItem, TargetId};
use enrichq_infra::controller::{ContinuationDispatcher, ContinuationError};
use enrichq_infra::{Controller, ControllerConfig, ControllerStore, InMemoryStore};
use enrichq_pipeline::{EnrichRequest, Enriched, EnrichmentPipeline, InMemoryTargets, PipelineError};

struct AlwaysOk;

#[async_trait::async_trait]
impl EnrichmentPipeline for AlwaysOk {
    async fn enrich(&self, _request: EnrichRequest) -> Result<Enriched, PipelineError> {
        Ok(Enriched::new(["summary"]))
    }
}

/// Records continuation counts instead of calling back over HTTP.
#[derive(Default)]
struct RecordingDispatcher {
    counts: Mutex<Vec<u32>>,
}

impl RecordingDispatcher {
    fn counts(&self) -> Vec<u32> {
        self.counts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ContinuationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, continuation_count: u32) -> Result<(), ContinuationError> {
        self.counts.lock().unwrap().push(continuation_count);
        Ok(())
    }
}

struct TestServer {
    base_url: String,
    store: Arc<InMemoryStore>,
    continuations: Arc<RecordingDispatcher>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = ControllerConfig::default()
            .with_inter_chunk_delay(Duration::from_millis(1))
            .with_max_continuations(3);
        Self::spawn_with(config).await
    }

    async fn spawn_with(config: ControllerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let continuations = Arc::new(RecordingDispatcher::default());

        let controller_store: Arc<dyn ControllerStore> = store.clone();
        let controller = Controller::new(
            controller_store,
            Arc::new(AlwaysOk),
            Arc::new(InMemoryTargets::new()),
            config,
        );
        let services = AppServices::new(Arc::new(controller), continuations.clone());

        // Same router as prod, bound to an ephemeral port.
        let app = enrichq_api::app::build_app(Arc::new(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            continuations,
            handle,
        }
    }

    fn seed(&self, n: usize) {
        let base = Utc::now() - chrono::Duration::minutes(5);
        for i in 0..n {
            self.store.insert(QueueItem::new(
                TargetId::new(),
                false,
                base + chrono::Duration::seconds(i as i64),
            ));
        }
    }

    async fn post(&self, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let res = reqwest::Client::new()
            .post(format!("{}/process", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap())
    }

    async fn continuations_eventually(&self, expected: usize) -> Vec<u32> {
        for _ in 0..50 {
            let counts = self.continuations.counts();
            if counts.len() >= expected {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.continuations.counts()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn empty_body_on_empty_queue_reports_no_work() {
    let srv = TestServer::spawn().await;

    let res = reqwest::Client::new()
        .post(format!("{}/process", srv.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["processed"], 0);
    assert_eq!(body["remaining"], 0);
    assert_eq!(body["message"], "No pending items");
}

#[tokio::test]
async fn processing_pass_drains_a_small_queue() {
    let srv = TestServer::spawn().await;
    srv.seed(3);

    let (status, body) = srv.post(json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 3);
    assert_eq!(body["succeeded"], 3);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["errors"].as_array().unwrap().len(), 0);
    assert_eq!(body["remaining"], 0);
    assert!(srv.store.items().iter().all(|i| i.status == ItemStatus::Completed));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(srv.continuations.counts().is_empty());
}

#[tokio::test]
async fn backlog_beyond_one_batch_triggers_a_continuation() {
    let srv = TestServer::spawn().await;
    srv.seed(15);

    let (status, body) = srv.post(json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 10);
    assert_eq!(body["remaining"], 5);
    assert_eq!(srv.continuations_eventually(1).await, vec![1]);

    let (_, body) = srv
        .post(json!({ "source": "self-continuation", "continuationCount": 1 }))
        .await;
    assert_eq!(body["processed"], 5);
    assert_eq!(body["remaining"], 0);
}

#[tokio::test]
async fn continuation_ceiling_fails_the_operation_instead_of_recursing() {
    let srv = TestServer::spawn().await;
    srv.seed(15);

    let (status, body) = srv
        .post(json!({ "source": "self-continuation", "continuationCount": 3 }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(srv.continuations.counts().is_empty());

    let status: serde_json::Value = reqwest::get(format!("{}/status", srv.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["operation"]["status"], "failed");
}

#[tokio::test]
async fn cancel_pending_only_touches_items_before_the_cutoff() {
    let srv = TestServer::spawn().await;
    srv.seed(4);
    let cutoff = Utc::now();
    let later = QueueItem::new(TargetId::new(), false, cutoff + chrono::Duration::seconds(30));
    srv.store.insert(later.clone());

    let (status, body) = srv
        .post(json!({ "action": "cancel_pending", "before": cutoff.to_rfc3339() }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "cancelled": 4 }));
    let items = srv.store.items();
    assert_eq!(items.iter().filter(|i| i.status == ItemStatus::Failed).count(), 4);
    let remaining = items.iter().find(|i| i.id == later.id).unwrap();
    assert_eq!(remaining.status, ItemStatus::Pending);
}

#[tokio::test]
async fn pause_blocks_processing_until_resumed() {
    let srv = TestServer::spawn().await;
    srv.seed(2);

    let (status, body) = srv.post(json!({ "action": "pause" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "paused": true }));

    let (_, body) = srv.post(json!({})).await;
    assert_eq!(body["processed"], 0);
    assert_eq!(body["remaining"], 2);
    assert!(srv.store.items().iter().all(|i| i.status == ItemStatus::Pending));

    let (_, body) = srv.post(json!({ "action": "resume" })).await;
    assert_eq!(body["paused"], false);

    let (_, body) = srv.post(json!({})).await;
    assert_eq!(body["succeeded"], 2);
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.post(json!({ "action": "purge" })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("purge"));
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let srv = TestServer::spawn().await;

    let res = reqwest::Client::new()
        .post(format!("{}/process", srv.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unreachable_store_is_a_server_error() {
    let srv = TestServer::spawn().await;
    srv.seed(1);
    srv.store.set_unavailable(true);

    let (status, body) = srv.post(json!({})).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("claim"));
}

#[tokio::test]
async fn status_reports_queue_counts_and_runs() {
    let srv = TestServer::spawn().await;
    srv.seed(2);
    srv.post(json!({})).await;

    let body: serde_json::Value = reqwest::get(format!("{}/status?runs=5", srv.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["queue"]["completed"], 2);
    assert_eq!(body["queue"]["pending"], 0);
    assert_eq!(body["operation"]["status"], "completed");
    assert_eq!(body["recent_runs"].as_array().unwrap().len(), 1);
}
