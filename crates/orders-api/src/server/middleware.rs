//! Axum middleware applied to the router.
//!
//! Tracing, timeout and compression come from `tower-http`; the idempotency
//! layer is an `axum::middleware::from_fn_with_state` function over [`AppState`].

use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::state::AppState;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Route every request through the idempotency coordinator.
pub async fn idempotency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state
        .idempotency
        .process(req, move |req| next.run(req))
        .await
}
