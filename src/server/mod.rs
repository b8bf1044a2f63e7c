//! HTTP surface of the gateway.

mod handlers;

use crate::gateway::Gateway;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the axum router with every `/v1` route.
pub fn router(gateway: Arc<Gateway>, max_body_bytes: usize) -> Router {
    let v1 = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/health", get(handlers::health))
        .route("/telemetry", post(handlers::ingest))
        .route("/telemetry/batch", post(handlers::ingest_batch))
        .route("/evidence", post(handlers::evidence))
        .route("/events/:event_id/analysis", get(handlers::analysis))
        .route("/events/:event_id/analyze", post(handlers::analyze));

    Router::new()
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{crash_body, gateway_with, BLOG_KEY, SHOP_KEY};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(per_minute: u32) -> Router {
        let queue = Arc::new(MemoryQueue::new(100, Duration::from_secs(30)));
        let store = Arc::new(MemoryStore::new());
        router(Arc::new(gateway_with(queue, store, per_minute)), 64 * 1024)
    }

    fn post(uri: &str, key: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn get_req(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, key)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let response = app(60)
            .oneshot(Request::builder().uri("/v1/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "pong"}));
    }

    #[tokio::test]
    async fn test_ingest_returns_202() {
        let response = app(60)
            .oneshot(post("/v1/telemetry", Some(SHOP_KEY), crash_body("evt-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            json_body(response).await,
            json!({"event_id": "evt-1", "status": "queued"})
        );
    }

    #[tokio::test]
    async fn test_batch_returns_202_with_per_event_results() {
        let body = serde_json::to_vec(&json!({
            "events": [
                {"event_id": "b-1", "payload": {"scrubbed": true, "category": "crash", "error_type": "E", "message": "m"}},
                {"event_id": "b-2", "payload": {"category": "crash", "error_type": "E", "message": "m"}}
            ]
        }))
        .unwrap();

        let response = app(60)
            .oneshot(post("/v1/telemetry/batch", Some(SHOP_KEY), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["rejected"], 1);
        assert_eq!(body["results"][0]["status"], "queued");
        assert_eq!(body["results"][1]["error"]["code"], "invalid_payload");
    }

    #[tokio::test]
    async fn test_missing_scrubbed_marker_is_400() {
        let body = serde_json::to_vec(&json!({
            "event_id": "evt-1",
            "payload": {"category": "crash", "error_type": "E", "message": "m"}
        }))
        .unwrap();

        let response = app(60)
            .oneshot(post("/v1/telemetry", Some(SHOP_KEY), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "invalid_payload");
    }

    #[tokio::test]
    async fn test_missing_key_is_401() {
        let response = app(60)
            .oneshot(post("/v1/telemetry", None, crash_body("evt-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_quota_is_429_with_retry_after() {
        let app = app(1);
        let first = app
            .clone()
            .oneshot(post("/v1/telemetry", Some(SHOP_KEY), crash_body("evt-1")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(post("/v1/telemetry", Some(SHOP_KEY), crash_body("evt-2")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_analysis_lifecycle_statuses() {
        let app = app(60);
        app.clone()
            .oneshot(post("/v1/telemetry", Some(SHOP_KEY), crash_body("evt-1")))
            .await
            .unwrap();

        let pending = app
            .clone()
            .oneshot(get_req("/v1/events/evt-1/analysis", SHOP_KEY))
            .await
            .unwrap();
        assert_eq!(pending.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(pending).await["status"], "queued");

        let foreign = app
            .clone()
            .oneshot(get_req("/v1/events/evt-1/analysis", BLOG_KEY))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

        let missing = app
            .clone()
            .oneshot(get_req("/v1/events/nope/analysis", SHOP_KEY))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let requeue = app
            .oneshot(post("/v1/events/evt-1/analyze", Some(SHOP_KEY), Vec::new()))
            .await
            .unwrap();
        assert_eq!(requeue.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_evidence_is_201() {
        let body = serde_json::to_vec(&json!({"type": "AUDIT_SCAN", "data": {"findings": 0}})).unwrap();
        let response = app(60)
            .oneshot(post("/v1/evidence", Some(SHOP_KEY), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["status"], "logged");
    }

    #[tokio::test]
    async fn test_health_reports_app() {
        let response = app(60)
            .oneshot(get_req("/v1/health", SHOP_KEY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["app"]["app_id"], "shop");
        assert_eq!(body["app"]["events_per_minute"], 60);
    }
}
