// HTTP surface
//
// One catch-all endpoint accepts OCR submissions; /stats reports counters
// and pool gauges. Validation failures answer before a task is ever built,
// so they never touch the stats.

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::any,
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::core::types::{OcrRequest, OcrResponse, OcrTask};
use crate::orchestration::pool::WorkerPool;
use crate::utils::ServerStats;

/// How long a submission may wait for queue capacity before 503.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted request body.
const BODY_LIMIT: usize = 100 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: mpsc::Sender<OcrTask>,
    pub pool: Arc<WorkerPool>,
    pub stats: ServerStats,
    pub queue_depth: Arc<AtomicI64>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/stats", any(stats_handler))
        .fallback(ocr_handler)
        .with_state(state)
        .layer(cors)
}

/// Accepts OCR submissions on any path except /stats.
async fn ocr_handler(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::POST {
        warn!("received unsupported method: {}", request.method());
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(body) => body,
        Err(e) => {
            warn!("error reading request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Error reading request body").into_response();
        }
    };

    let parsed: OcrRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("error parsing JSON: {}", e);
            return (StatusCode::BAD_REQUEST, "Error parsing JSON").into_response();
        }
    };

    // Empty strings count as absent, matching the wire contract.
    let image_path = parsed.image_path.filter(|s| !s.is_empty());
    let image_base64 = parsed.image_base64.filter(|s| !s.is_empty());

    if image_path.is_none() && image_base64.is_none() {
        warn!("received request with missing image data");
        return (
            StatusCode::BAD_REQUEST,
            "Missing image_path or image_base64 parameter",
        )
            .into_response();
    }

    let image_data = match image_base64 {
        Some(encoded) => match general_purpose::STANDARD.decode(encoded) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("invalid base64 image data: {}", e);
                return (StatusCode::BAD_REQUEST, "Invalid base64 image data").into_response();
            }
        },
        None => Vec::new(),
    };

    debug!("received OCR request, queueing task");
    let (reply_tx, reply_rx) = oneshot::channel();
    let task = OcrTask {
        image_path,
        image_data,
        reply: reply_tx,
    };

    match tokio::time::timeout(ADMISSION_TIMEOUT, state.queue.send(task)).await {
        Ok(Ok(())) => {
            state.queue_depth.fetch_add(1, Ordering::SeqCst);
            debug!("task queued successfully");
            match reply_rx.await {
                Ok(response) => Json(response).into_response(),
                // The scheduler dropped the task without replying; only
                // happens when it exits mid-shutdown.
                Err(_) => Json(OcrResponse::err("server is shutting down")).into_response(),
            }
        }
        Ok(Err(_)) | Err(_) => {
            warn!("task queue is full, request timed out");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server is too busy, please try again later",
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    /// Failed share of completed requests, in percent.
    pub error_rate: f64,
    /// Running mean, in seconds.
    pub average_processing_time: f64,
    pub active_processors: usize,
    pub in_use_processors: usize,
    pub idle_processors: usize,
    pub queue_length: i64,
    pub total_usage: i64,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsReport> {
    debug!("received request for server stats");
    Json(build_stats(&state))
}

fn build_stats(state: &AppState) -> StatsReport {
    let gauges = state.pool.gauges();
    StatsReport {
        total_requests: state.stats.total_requests(),
        successful_requests: state.stats.successful_requests(),
        failed_requests: state.stats.failed_requests(),
        error_rate: state.stats.error_rate(),
        average_processing_time: state.stats.average_processing_time().as_secs_f64(),
        active_processors: gauges.active_processors,
        in_use_processors: gauges.in_use_processors,
        idle_processors: gauges.idle_processors,
        queue_length: state.queue_depth.load(Ordering::SeqCst).max(0),
        total_usage: gauges.total_usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::services::engine::testing::MockFactory;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_state(queue_capacity: usize) -> (AppState, mpsc::Receiver<OcrTask>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let config = Arc::new(Config::default());
        let pool = Arc::new(WorkerPool::new(config, Arc::new(MockFactory::new())));
        (
            AppState {
                queue: queue_tx,
                pool,
                stats: ServerStats::new(),
                queue_depth: Arc::new(AtomicI64::new(0)),
            },
            queue_rx,
        )
    }

    fn post(uri: &str, body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_non_post_is_rejected() {
        let (state, _queue_rx) = test_state(1);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let (state, _queue_rx) = test_state(1);
        let response = router(state)
            .oneshot(post("/", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_image_fields_are_rejected() {
        let (state, _queue_rx) = test_state(1);
        let stats = state.stats.clone();

        let response = router(state.clone()).oneshot(post("/", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Empty strings count as missing.
        let response = router(state)
            .oneshot(post("/", r#"{"image_path":"","image_base64":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Validation failures never touch the counters.
        assert_eq!(stats.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_invalid_base64_is_rejected() {
        let (state, _queue_rx) = test_state(1);
        let response = router(state)
            .oneshot(post("/", r#"{"image_base64":"@@not-base64@@"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submission_round_trip() {
        let (state, mut queue_rx) = test_state(4);

        // Stub scheduler: decode happens in the handler, the reply comes
        // from here.
        tokio::spawn(async move {
            while let Some(task) = queue_rx.recv().await {
                assert_eq!(task.image_data, b"hello");
                let _ = task
                    .reply
                    .send(OcrResponse::ok(serde_json::json!([{ "text": "hi" }])));
            }
        });

        let encoded = general_purpose::STANDARD.encode(b"hello");
        let response = router(state)
            .oneshot(post(
                "/any/path",
                &format!(r#"{{"image_base64":"{}"}}"#, encoded),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"][0]["text"], "hi");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_returns_busy() {
        let (state, queue_rx) = test_state(1);
        drop(queue_rx);

        let response = router(state)
            .oneshot(post("/", r#"{"image_path":"/tmp/x.png"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_endpoint_reports_gauges() {
        let (state, _queue_rx) = test_state(1);
        state.stats.record(Duration::from_millis(500), true);
        state.stats.record(Duration::from_millis(1500), false);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/stats")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["total_requests"], 2);
        assert_eq!(json["successful_requests"], 1);
        assert_eq!(json["failed_requests"], 1);
        assert_eq!(json["error_rate"], 50.0);
        assert_eq!(json["average_processing_time"], 1.0);
        assert_eq!(json["active_processors"], 0);
        assert_eq!(json["queue_length"], 0);
    }
}
