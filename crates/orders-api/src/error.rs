//! Rendering of [`ServiceError`] as an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::ServiceError;

/// Render `err` as its status code and the standard error envelope.
pub fn respond(err: ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_response())).into_response()
}
