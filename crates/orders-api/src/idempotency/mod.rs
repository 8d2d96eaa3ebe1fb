//! Request deduplication for mutating endpoints.
//!
//! A client attaches an `Idempotency-Key` (a v4 UUID) to a POST/PUT/PATCH/DELETE.
//! The first request with a given key reserves it, runs the handler and
//! records the response; any later request with the same key and the same
//! fingerprint gets that response back verbatim without running the handler.
//!
//! # Lifecycle
//!
//! 1. [`key::classify`] validates the header.
//! 2. [`fingerprint::RequestFingerprinter`] digests method, path and canonical body.
//! 3. [`RecordStore::create`] atomically reserves the key.
//! 4. The handler runs; [`capture`] observes its response.
//! 5. [`RecordStore::finalize`] records it, or the reservation is released.
//! 6. A background [`prune_task`] deletes expired records.
//!
//! # Invariants
//!
//! - A live key maps to exactly one fingerprint.
//! - A recorded response is never modified.
//! - No reservation stays in flight forever: it is released on cancellation,
//!   and its lease lets a later request take it over after a crash.

pub mod capture;
pub mod coordinator;
pub mod fingerprint;
pub mod key;
pub mod record;
pub mod store;

pub use coordinator::{IdempotencyCoordinator, IdempotencyPolicy};
pub use store::{RecordStore, StoreBackend};

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Inbound header carrying the client's key.
pub const IDEMPOTENCY_KEY_HEADER: HeaderName = HeaderName::from_static("idempotency-key");

/// Set on responses served from a recorded result.
pub const REPLAYED_HEADER: HeaderName = HeaderName::from_static("idempotent-replayed");

/// Spawn a background task that periodically deletes expired records.
///
/// The first prune fires after one full interval. Failures are logged and
/// retried on the next tick; expired records are already ignored by lookups.
pub fn prune_task(store: Arc<dyn RecordStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.prune_expired(OffsetDateTime::now_utc()).await {
                Ok(0) => debug!("no expired idempotency records"),
                Ok(removed) => info!(removed, backend = %store.backend(), "pruned expired idempotency records"),
                Err(e) => warn!(error = %e, backend = %store.backend(), "idempotency prune failed"),
            }
        }
    })
}
