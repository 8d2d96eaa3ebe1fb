//! [`IdempotencyCoordinator`]: the per-request decision procedure.
//!
//! | Situation | Outcome |
//! |---|---|
//! | safe method, or no key | handler runs untouched |
//! | malformed key | 400 `INVALID_IDEMPOTENCY_KEY`, handler not called |
//! | no live record | reserve, run handler, record response |
//! | live record, same fingerprint, finished | replay recorded response |
//! | live record, same fingerprint, in flight | wait for it, then replay |
//! | live record, different fingerprint | 409 `IDEMPOTENCY_KEY_REUSED` |
//!
//! # Degraded mode
//!
//! If the store fails while reserving, the request proceeds **without**
//! deduplication and a `warn` event tagged `idempotency degraded` is emitted.
//! Availability is preferred over strict at-most-once for that attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    response::Response,
};
use common::ServiceError;
use http_body_util::LengthLimitError;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture;
use super::fingerprint::{Fingerprint, RequestFingerprinter};
use super::key::{self, IdempotencyKey, KeyCheck};
use super::record::{IdempotencyRecord, StoredResponse};
use super::store::{RecordStore, Reservation, StoreError};
use super::IDEMPOTENCY_KEY_HEADER;
use crate::error::respond;

/// How often a duplicate re-reads an in-flight record.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Tunables for the idempotency layer.
#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    /// How long a recorded response is honoured.
    pub retention: Duration,
    /// Lease on an in-flight reservation.
    pub in_flight_timeout: Duration,
    /// How long a duplicate waits for the in-flight original.
    pub wait_timeout: Duration,
    /// Largest request body read for fingerprinting.
    pub max_body_bytes: usize,
    /// Deepest JSON nesting accepted.
    pub max_body_depth: usize,
    /// Largest response body recorded.
    pub max_response_bytes: usize,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            in_flight_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(10),
            max_body_bytes: 1024 * 1024,
            max_body_depth: 64,
            max_response_bytes: 1024 * 1024,
        }
    }
}

enum Verdict {
    Proceed(ReservationGuard),
    Replay(StoredResponse),
    Reject(ServiceError),
    Unprotected,
}

enum Waited {
    Settled(Verdict),
    Vacated,
}

/// Orchestrates key validation, fingerprinting, reservation and replay.
pub struct IdempotencyCoordinator {
    store: Arc<dyn RecordStore>,
    fingerprinter: RequestFingerprinter,
    policy: IdempotencyPolicy,
}

impl IdempotencyCoordinator {
    /// Create a coordinator over the given store. The backend is fixed for its lifetime.
    pub fn new(store: Arc<dyn RecordStore>, policy: IdempotencyPolicy) -> Self {
        Self {
            store,
            fingerprinter: RequestFingerprinter::new(policy.max_body_depth),
            policy,
        }
    }

    /// The underlying record store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Run `handler` for `req` under the idempotency contract.
    pub async fn process<F, Fut>(&self, req: Request, handler: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if req.method().is_safe() {
            return handler(req).await;
        }
        let key = match key::classify(req.headers().get(&IDEMPOTENCY_KEY_HEADER)) {
            KeyCheck::NoKey => return handler(req).await,
            KeyCheck::Invalid => {
                debug!(method = %req.method(), path = req.uri().path(), "malformed idempotency key");
                return respond(ServiceError::InvalidIdempotencyKey);
            }
            KeyCheck::Valid(key) => key,
        };

        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, self.policy.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => return respond(body_read_error(e)),
        };
        let fingerprint =
            match self
                .fingerprinter
                .fingerprint(&parts.method, parts.uri.path(), &bytes)
            {
                Ok(fp) => fp,
                Err(e) => return respond(ServiceError::InvalidRequestBody(e.to_string())),
            };
        let req = Request::from_parts(parts, Body::from(bytes));

        match self.reserve(&key, &fingerprint).await {
            Verdict::Proceed(guard) => self.execute(guard, req, handler).await,
            Verdict::Replay(stored) => {
                info!(key = %key, status = stored.status, "replaying recorded response");
                capture::replay(&stored)
            }
            Verdict::Reject(err) => respond(err),
            Verdict::Unprotected => handler(req).await,
        }
    }

    async fn reserve(&self, key: &IdempotencyKey, fingerprint: &Fingerprint) -> Verdict {
        // `None` means the wait never gives up.
        let deadline = Instant::now().checked_add(self.policy.wait_timeout);
        loop {
            let record = match IdempotencyRecord::reserve(
                key.clone(),
                fingerprint.clone(),
                OffsetDateTime::now_utc(),
                self.policy.retention,
                self.policy.in_flight_timeout,
            ) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        "idempotency degraded: reservation window invalid, proceeding without deduplication"
                    );
                    return Verdict::Unprotected;
                }
            };
            let reservation_id = record.reservation_id;
            match self.store.create(&record).await {
                Ok(Reservation::Acquired) => {
                    debug!(key = %key, "reservation acquired");
                    return Verdict::Proceed(ReservationGuard {
                        store: Arc::clone(&self.store),
                        key: key.clone(),
                        reservation_id,
                        armed: true,
                    });
                }
                Ok(Reservation::Existing(existing)) => {
                    match self.await_existing(existing, fingerprint, deadline).await {
                        Waited::Settled(verdict) => return verdict,
                        Waited::Vacated => continue,
                    }
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        backend = %self.store.backend(),
                        error = %e,
                        "idempotency degraded: store unavailable, proceeding without deduplication"
                    );
                    return Verdict::Unprotected;
                }
            }
        }
    }

    /// Follow a record held by another request until it settles or vacates.
    async fn await_existing(
        &self,
        mut existing: IdempotencyRecord,
        fingerprint: &Fingerprint,
        deadline: Option<Instant>,
    ) -> Waited {
        loop {
            if existing.fingerprint != *fingerprint {
                info!(key = %existing.key, "idempotency key reused with a different request");
                return Waited::Settled(Verdict::Reject(ServiceError::IdempotencyKeyReused));
            }
            if let Some(stored) = existing.response {
                return Waited::Settled(Verdict::Replay(stored));
            }
            if existing.is_stale(OffsetDateTime::now_utc()) {
                return Waited::Vacated;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Waited::Settled(Verdict::Reject(ServiceError::RequestInProgress));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            match self.store.lookup(&existing.key, OffsetDateTime::now_utc()).await {
                Ok(Some(record)) => existing = record,
                Ok(None) => return Waited::Vacated,
                Err(e) => {
                    // Another request is known to hold the key; running ours could duplicate it.
                    warn!(key = %existing.key, error = %e, "store failed while awaiting in-flight request");
                    return Waited::Settled(Verdict::Reject(ServiceError::RequestInProgress));
                }
            }
        }
    }

    async fn execute<F, Fut>(&self, guard: ReservationGuard, req: Request, handler: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let response = handler(req).await;
        let captured = match capture::capture(response, self.policy.max_response_bytes).await {
            Ok(captured) => captured,
            Err(e) => {
                warn!(key = %guard.key, error = %e, "response capture failed");
                guard.release().await;
                return respond(ServiceError::Internal(e.to_string()));
            }
        };

        let status = captured.response.status();
        match captured.recordable {
            Some(stored) if !status.is_server_error() => {
                let key = guard.key.clone();
                if let Err(e) = guard.finalize(&stored).await {
                    warn!(
                        key = %key,
                        error = %e,
                        "idempotency degraded: response not recorded"
                    );
                }
            }
            Some(_) => {
                info!(key = %guard.key, status = status.as_u16(), "server error not recorded");
                guard.release().await;
            }
            None => {
                warn!(key = %guard.key, "response too large to record");
                guard.release().await;
            }
        }
        captured.response
    }
}

/// Ownership of an in-flight reservation.
///
/// Dropping an armed guard (handler cancelled or timed out) releases the
/// reservation in the background, so the key never stays in flight.
struct ReservationGuard {
    store: Arc<dyn RecordStore>,
    key: IdempotencyKey,
    reservation_id: Uuid,
    armed: bool,
}

impl ReservationGuard {
    async fn finalize(mut self, stored: &StoredResponse) -> Result<(), StoreError> {
        let result = self
            .store
            .finalize(&self.key, self.reservation_id, stored)
            .await;
        // On an unreachable store stay armed so Drop retries the release.
        if !matches!(result, Err(StoreError::Unavailable(_))) {
            self.armed = false;
        }
        result
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.release(&self.key, self.reservation_id).await {
            warn!(key = %self.key, error = %e, "failed to release reservation");
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let reservation_id = self.reservation_id;
        debug!(key = %key, "releasing abandoned reservation");
        handle.spawn(async move {
            if let Err(e) = store.release(&key, reservation_id).await {
                warn!(key = %key, error = %e, "failed to release abandoned reservation");
            }
        });
    }
}

fn body_read_error(err: axum::Error) -> ServiceError {
    if err.into_inner().is::<LengthLimitError>() {
        ServiceError::PayloadTooLarge
    } else {
        ServiceError::InvalidRequestBody("body could not be read".into())
    }
}
