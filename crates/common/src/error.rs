//! Common error types shared across crates.

use thiserror::Error;

use crate::protocol::ErrorResponse;

/// Top-level service error type.
///
/// Every variant carries a stable machine-readable code and maps to the HTTP
/// status returned to callers:
/// - [`ServiceError::InvalidIdempotencyKey`], [`ServiceError::InvalidRequestBody`] → 400
/// - [`ServiceError::NotFound`] → 404
/// - [`ServiceError::IdempotencyKeyReused`], [`ServiceError::RequestInProgress`] → 409
/// - [`ServiceError::PayloadTooLarge`] → 413
/// - [`ServiceError::Internal`] → 500
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The `Idempotency-Key` header is present but not a canonical v4 UUID.
    #[error("invalid idempotency key")]
    InvalidIdempotencyKey,

    /// The idempotency key was already used for a request with a different fingerprint.
    #[error("idempotency key reused with a different request")]
    IdempotencyKeyReused,

    /// Another request with the same key and fingerprint is still executing.
    #[error("idempotent request still in progress")]
    RequestInProgress,

    /// The request body exceeds the configured size bound.
    #[error("request body too large")]
    PayloadTooLarge,

    /// The request body could not be accepted (e.g. nested beyond the depth bound).
    #[error("invalid request body: {0}")]
    InvalidRequestBody(String),

    /// The requested resource does not exist.
    #[error("not found")]
    NotFound,

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::InvalidIdempotencyKey | ServiceError::InvalidRequestBody(_) => 400,
            ServiceError::NotFound => 404,
            ServiceError::IdempotencyKeyReused | ServiceError::RequestInProgress => 409,
            ServiceError::PayloadTooLarge => 413,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Returns the stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            ServiceError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            ServiceError::RequestInProgress => "IDEMPOTENCY_REQUEST_IN_PROGRESS",
            ServiceError::PayloadTooLarge => "REQUEST_BODY_TOO_LARGE",
            ServiceError::InvalidRequestBody(_) => "INVALID_REQUEST_BODY",
            ServiceError::NotFound => "NOT_FOUND",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to expose to callers.
    ///
    /// Never includes the detail string carried by [`ServiceError::Internal`];
    /// it is for logs only.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::InvalidIdempotencyKey => {
                "Idempotency-Key must be a valid v4 identifier".into()
            }
            ServiceError::IdempotencyKeyReused => {
                "Idempotency-Key has been used with a different request body".into()
            }
            ServiceError::RequestInProgress => {
                "A request with this Idempotency-Key is still being processed".into()
            }
            ServiceError::PayloadTooLarge => "Request body exceeds the allowed size".into(),
            ServiceError::InvalidRequestBody(reason) => format!("Request body rejected: {reason}"),
            ServiceError::NotFound => "The requested resource does not exist".into(),
            ServiceError::Internal(_) => "Internal server error".into(),
        }
    }

    /// Build the wire envelope for this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.public_message())
    }
}
