use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use enrichq_api::continuation::HttpContinuationDispatcher;
use enrichq_infra::controller::{dispatch_with_retry, ContinuationDispatcher, ContinuationError};

/// A `/process` stand-in that counts hits, waits `delay` and answers `status`.
async fn spawn_endpoint(delay: Duration, status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/process",
            post(move |State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                status
            }),
        )
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/process"), hits)
}

#[tokio::test]
async fn timed_out_continuation_starts_one_invocation_only() {
    let (url, hits) = spawn_endpoint(Duration::from_millis(300), StatusCode::OK).await;
    let dispatcher = HttpContinuationDispatcher::new(url, Duration::from_millis(200)).unwrap();

    let result = dispatch_with_retry(&dispatcher, 1, 3, Duration::from_millis(10)).await;

    assert!(matches!(result, Err(ContinuationError::Transport(_))));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gateway_rejection_is_retried() {
    let (url, hits) = spawn_endpoint(Duration::ZERO, StatusCode::SERVICE_UNAVAILABLE).await;
    let dispatcher = HttpContinuationDispatcher::new(url, Duration::from_secs(5)).unwrap();

    let result = dispatch_with_retry(&dispatcher, 1, 3, Duration::from_millis(10)).await;

    assert!(matches!(result, Err(ContinuationError::Rejected { status: 503, .. })));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dispatcher =
        HttpContinuationDispatcher::new(format!("http://{addr}/process"), Duration::from_secs(5)).unwrap();

    let err = dispatcher.dispatch(1).await.unwrap_err();

    assert!(matches!(err, ContinuationError::Unreachable(_)), "got {err:?}");
    assert!(err.is_retryable());
}
