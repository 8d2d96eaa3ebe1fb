//! Request and response types exchanged over the public HTTP API.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Orders endpoint
// ---------------------------------------------------------------------------

/// Request body for `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Catalog SKU being ordered.
    pub sku: String,
    /// Number of units.
    pub qty: u32,
}

/// Response body for `POST /orders` and `GET /orders/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    /// Server-assigned order identifier.
    pub id: String,
    /// Catalog SKU.
    pub sku: String,
    /// Number of units.
    pub qty: u32,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error envelope returned on any non-2xx status:
/// `{ "success": false, "error": { "code": ..., "message": ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Error detail.
    pub error: ErrorBody,
}

/// Inner error detail of an [`ErrorResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable error code (e.g. `"IDEMPOTENCY_KEY_REUSED"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Configured idempotency backend (`"memory"` or `"sqlite"`).
    pub idempotency_backend: String,
    /// Whether the idempotency store answered its reachability probe.
    pub idempotency_store_reachable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelope_shape() {
        let e = ErrorResponse::new("IDEMPOTENCY_KEY_REUSED", "reused");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(
            v,
            json!({"success": false, "error": {"code": "IDEMPOTENCY_KEY_REUSED", "message": "reused"}})
        );
    }

    #[test]
    fn create_order_request_parses() {
        let req: CreateOrderRequest = serde_json::from_value(json!({"sku": "X", "qty": 2})).unwrap();
        assert_eq!(req.sku, "X");
        assert_eq!(req.qty, 2);
    }

    #[test]
    fn health_response_serde() {
        let h = HealthResponse {
            status: "ok".into(),
            idempotency_backend: "memory".into(),
            idempotency_store_reachable: true,
        };
        let json = serde_json::to_string(&h).unwrap();
        let decoded: HealthResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.idempotency_backend, "memory");
    }
}
