//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::idempotency::store::MemoryRecordStore;
use crate::idempotency::{IdempotencyCoordinator, IdempotencyPolicy};
use crate::orders::OrderBook;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable so that Axum can clone the state for each
/// request without copying data.
#[derive(Clone)]
pub struct AppState {
    /// Deduplication layer for mutating requests.
    pub idempotency: Arc<IdempotencyCoordinator>,
    /// Orders created through the API.
    pub orders: OrderBook,
}

impl AppState {
    /// Create a new [`AppState`].
    pub fn new(idempotency: IdempotencyCoordinator, orders: OrderBook) -> Self {
        Self {
            idempotency: Arc::new(idempotency),
            orders,
        }
    }
}

impl Default for AppState {
    /// In-memory store with the default policy, suitable for tests.
    fn default() -> Self {
        Self::new(
            IdempotencyCoordinator::new(
                Arc::new(MemoryRecordStore::new()),
                IdempotencyPolicy::default(),
            ),
            OrderBook::new(),
        )
    }
}
