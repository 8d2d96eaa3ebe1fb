//! [`OrderBook`]: in-process order storage behind the mutating endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use common::protocol::{CreateOrderRequest, OrderResponse};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Thread-safe map of orders keyed by id.
#[derive(Clone, Debug, Default)]
pub struct OrderBook {
    inner: Arc<RwLock<HashMap<String, OrderResponse>>>,
}

impl OrderBook {
    /// Create a new, empty order book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an order and return it. Every call creates a new order.
    pub async fn create(&self, req: CreateOrderRequest) -> OrderResponse {
        let order = OrderResponse {
            id: Uuid::new_v4().to_string(),
            sku: req.sku,
            qty: req.qty,
        };
        self.inner
            .write()
            .await
            .insert(order.id.clone(), order.clone());
        order
    }

    /// Look up an order by id.
    pub async fn get(&self, id: &str) -> Option<OrderResponse> {
        self.inner.read().await.get(id).cloned()
    }

    /// Number of orders created so far.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
