//! [`RecordStore`]: storage for idempotency records, with two backends.
//!
//! | Backend | Scope | Atomic reservation via |
//! |---|---|---|
//! | [`MemoryRecordStore`] | one process, lost on restart | async mutex over the map |
//! | [`SqliteRecordStore`] | every instance sharing the database file | `PRIMARY KEY` + conditional upsert |
//!
//! The memory backend is **unsound behind more than one running instance**: each
//! instance would hold its own map and could execute the same key twice.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::key::IdempotencyKey;
use super::record::{IdempotencyRecord, StoredResponse};

/// Errors produced by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the operation.
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("idempotency record corrupt: {0}")]
    Corrupt(String),

    /// The caller no longer owns the reservation (it was released, expired or taken over).
    #[error("reservation no longer held")]
    ReservationLost,
}

/// Result of an atomic reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller inserted the record and now owns the key.
    Acquired,
    /// A live record already exists; the caller must not run the handler.
    Existing(IdempotencyRecord),
}

/// Which backend to build. Chosen once, from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map. Single instance only.
    #[default]
    Memory,
    /// SQLite database shared by all instances.
    Sqlite,
}

impl StoreBackend {
    /// Stable lowercase name, used in logs and `/health`.
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage contract for idempotency records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> StoreBackend;

    /// Atomically insert `record` unless a live record for its key exists.
    ///
    /// An expired record, or an abandoned reservation with the same fingerprint,
    /// is replaced as part of the same atomic step.
    async fn create(&self, record: &IdempotencyRecord) -> Result<Reservation, StoreError>;

    /// Attach the response to the caller's own unfinished reservation.
    async fn finalize(
        &self,
        key: &IdempotencyKey,
        reservation_id: Uuid,
        response: &StoredResponse,
    ) -> Result<(), StoreError>;

    /// Drop the caller's own unfinished reservation so a retry starts afresh.
    async fn release(&self, key: &IdempotencyKey, reservation_id: Uuid) -> Result<(), StoreError>;

    /// Fetch the live record for `key`; expired records read as `None`.
    async fn lookup(
        &self,
        key: &IdempotencyKey,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Physically delete expired records, returning how many were removed.
    async fn prune_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Whether `record` is past its retention window.
    fn is_expired(&self, record: &IdempotencyRecord, now: OffsetDateTime) -> bool {
        record.is_expired(now)
    }
}

/// Build the configured backend.
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened or migrated.
pub fn build(
    backend: StoreBackend,
    sqlite_path: Option<&std::path::Path>,
) -> anyhow::Result<Arc<dyn RecordStore>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRecordStore::new())),
        StoreBackend::Sqlite => {
            let path = sqlite_path
                .ok_or_else(|| anyhow::anyhow!("sqlite backend selected without a database path"))?;
            Ok(Arc::new(SqliteRecordStore::open(path)?))
        }
    }
}
