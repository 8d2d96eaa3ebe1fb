//! Axum request handlers for all service endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{CreateOrderRequest, HealthResponse};
use common::ServiceError;
use tracing::{info, warn};

use super::state::AppState;
use crate::error::respond;

/// `POST /orders`: create an order.
///
/// Protected by the idempotency layer: a retry carrying the same
/// `Idempotency-Key` and body returns the original `201` without creating a
/// second order.
pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Response {
    let order = state.orders.create(req).await;
    info!(order_id = %order.id, "order created");
    (StatusCode::CREATED, Json(order)).into_response()
}

/// `GET /orders/:id`: fetch an order.
pub async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orders.get(&id).await {
        Some(order) => (StatusCode::OK, Json(order)).into_response(),
        None => respond(ServiceError::NotFound),
    }
}

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` when the idempotency store answers its probe, and
/// `503 Service Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let store = state.idempotency.store();
    let reachable = match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, backend = %store.backend(), "idempotency store probe failed");
            false
        }
    };

    let (status_code, status_str) = if reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        idempotency_backend: store.backend().to_string(),
        idempotency_store_reachable: reachable,
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> Response {
    respond(ServiceError::NotFound)
}
