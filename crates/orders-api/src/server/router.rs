//! Axum router construction.

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
///
/// The idempotency layer sits inside compression (recorded bodies are the
/// uncompressed handler output) and inside the timeout (a timed-out handler
/// drops its reservation).
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(handlers::create_order))
        .route("/orders/:id", get(handlers::get_order))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .layer(from_fn_with_state(state.clone(), middleware::idempotency))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const KEY: &str = "12345678-1234-4567-8901-123456789012";

    fn post_order(key: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json");
        if let Some(k) = key {
            builder = builder.header("Idempotency-Key", k);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build(AppState::default());
        let req = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn retried_order_is_created_once() {
        let state = AppState::default();
        let app = build(state.clone());

        let (s1, b1) = call(&app, post_order(Some(KEY), json!({"sku": "X", "qty": 2}))).await;
        let (s2, b2) = call(&app, post_order(Some(KEY), json!({"sku": "X", "qty": 2}))).await;

        assert_eq!(s1, StatusCode::CREATED);
        assert_eq!(s2, StatusCode::CREATED);
        assert_eq!(b1, b2);
        assert!(b1["id"].is_string());
        assert_eq!(state.orders.len().await, 1);
    }

    #[tokio::test]
    async fn changed_body_with_same_key_conflicts() {
        let state = AppState::default();
        let app = build(state.clone());

        call(&app, post_order(Some(KEY), json!({"sku": "X", "qty": 2}))).await;
        let (status, body) = call(&app, post_order(Some(KEY), json!({"sku": "X", "qty": 3}))).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body,
            json!({
                "success": false,
                "error": {
                    "code": "IDEMPOTENCY_KEY_REUSED",
                    "message": "Idempotency-Key has been used with a different request body"
                }
            })
        );
        assert_eq!(state.orders.len().await, 1);
    }

    #[tokio::test]
    async fn malformed_key_is_rejected_with_400() {
        let state = AppState::default();
        let app = build(state.clone());

        let (status, body) =
            call(&app, post_order(Some("not-a-uuid"), json!({"sku": "X", "qty": 2}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({
                "success": false,
                "error": {
                    "code": "INVALID_IDEMPOTENCY_KEY",
                    "message": "Idempotency-Key must be a valid v4 identifier"
                }
            })
        );
        assert_eq!(state.orders.len().await, 0);
    }

    #[tokio::test]
    async fn orders_without_key_are_not_deduplicated() {
        let state = AppState::default();
        let app = build(state.clone());
        call(&app, post_order(None, json!({"sku": "X", "qty": 2}))).await;
        call(&app, post_order(None, json!({"sku": "X", "qty": 2}))).await;
        assert_eq!(state.orders.len().await, 2);
    }

    #[tokio::test]
    async fn get_ignores_idempotency_header() {
        let state = AppState::default();
        let app = build(state.clone());
        let (_, created) = call(&app, post_order(None, json!({"sku": "X", "qty": 2}))).await;

        let req = Request::builder()
            .uri(format!("/orders/{}", created["id"].as_str().unwrap()))
            .header("Idempotency-Key", "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, created);
    }

    #[tokio::test]
    async fn simultaneous_retries_create_one_order() {
        let state = AppState::default();
        let app = build(state.clone());

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let app = app.clone();
            tasks.push(tokio::spawn(async move {
                call(&app, post_order(Some(KEY), json!({"sku": "X", "qty": 2}))).await
            }));
        }
        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap());
        }

        assert_eq!(state.orders.len().await, 1);
        assert!(results.iter().all(|r| *r == results[0]));
        assert_eq!(results[0].0, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_route_reports_backend() {
        let app = build(AppState::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["idempotency_backend"], "memory");
    }
}
