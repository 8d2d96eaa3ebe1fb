//! [`SqliteRecordStore`]: persistent record store shared by every instance.
//!
//! Each instance opens its own connection to the same database file. The
//! reservation is a single conditional upsert inside an `IMMEDIATE`
//! transaction, so the database's write lock and the `key` primary key decide
//! which request wins; no in-process lock is relied upon for correctness.
//!
//! Blocking SQLite calls run on the Tokio blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{RecordStore, Reservation, StoreBackend, StoreError};
use crate::idempotency::fingerprint::Fingerprint;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{IdempotencyRecord, StoredResponse};

/// How long a connection waits on another instance's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "\
PRAGMA journal_mode=WAL;
PRAGMA synchronous=FULL;
CREATE TABLE IF NOT EXISTS idempotency_records (
    key TEXT PRIMARY KEY NOT NULL,
    request_fingerprint TEXT NOT NULL,
    reservation_id TEXT NOT NULL,
    response_status INTEGER,
    response_content_type TEXT,
    response_body BLOB,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    lease_expires_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_records_expires
    ON idempotency_records(expires_at_ms);";

// A conflicting row is overwritten only when it has expired, or when it is an
// abandoned reservation for the same fingerprint. Otherwise zero rows change.
const RESERVE: &str = "\
INSERT INTO idempotency_records (
    key, request_fingerprint, reservation_id,
    response_status, response_content_type, response_body,
    created_at_ms, expires_at_ms, lease_expires_at_ms
) VALUES (?1, ?2, ?3, NULL, NULL, NULL, ?4, ?5, ?6)
ON CONFLICT(key) DO UPDATE SET
    request_fingerprint = excluded.request_fingerprint,
    reservation_id = excluded.reservation_id,
    response_status = NULL,
    response_content_type = NULL,
    response_body = NULL,
    created_at_ms = excluded.created_at_ms,
    expires_at_ms = excluded.expires_at_ms,
    lease_expires_at_ms = excluded.lease_expires_at_ms
WHERE idempotency_records.expires_at_ms <= excluded.created_at_ms
   OR (idempotency_records.response_status IS NULL
       AND idempotency_records.lease_expires_at_ms <= excluded.created_at_ms
       AND idempotency_records.request_fingerprint = excluded.request_fingerprint)";

const SELECT: &str = "\
SELECT request_fingerprint, reservation_id, response_status, response_content_type,
       response_body, created_at_ms, expires_at_ms, lease_expires_at_ms
FROM idempotency_records WHERE key = ?1";

/// SQLite-backed record store.
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the database at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        info!(path = %path.display(), "sqlite idempotency store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn create(&self, record: &IdempotencyRecord) -> Result<Reservation, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let changed = tx
                .execute(
                    RESERVE,
                    params![
                        record.key.as_str(),
                        record.fingerprint.as_str(),
                        record.reservation_id.to_string(),
                        to_millis(record.created_at),
                        to_millis(record.expires_at),
                        to_millis(record.lease_expires_at),
                    ],
                )
                .map_err(unavailable)?;
            let outcome = if changed == 1 {
                Reservation::Acquired
            } else {
                // The write lock is still held, so the conflicting row cannot vanish.
                let existing = select(&tx, &record.key)?.ok_or_else(|| {
                    StoreError::Unavailable("conflicting idempotency row not found".into())
                })?;
                Reservation::Existing(existing)
            };
            tx.commit().map_err(unavailable)?;
            Ok(outcome)
        })
        .await
    }

    async fn finalize(
        &self,
        key: &IdempotencyKey,
        reservation_id: Uuid,
        response: &StoredResponse,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        let response = response.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE idempotency_records
                     SET response_status = ?3, response_content_type = ?4, response_body = ?5
                     WHERE key = ?1 AND reservation_id = ?2 AND response_status IS NULL",
                    params![
                        key.as_str(),
                        reservation_id.to_string(),
                        i64::from(response.status),
                        response.content_type,
                        response.body.as_ref(),
                    ],
                )
                .map_err(unavailable)?;
            if changed == 1 {
                Ok(())
            } else {
                Err(StoreError::ReservationLost)
            }
        })
        .await
    }

    async fn release(&self, key: &IdempotencyKey, reservation_id: Uuid) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM idempotency_records
                 WHERE key = ?1 AND reservation_id = ?2 AND response_status IS NULL",
                params![key.as_str(), reservation_id.to_string()],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn lookup(
        &self,
        key: &IdempotencyKey,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let key = key.clone();
        let record = self.with_conn(move |conn| select(conn, &key)).await?;
        Ok(record.filter(|r| !self.is_expired(r, now)))
    }

    async fn prune_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM idempotency_records WHERE expires_at_ms <= ?1",
                    params![to_millis(now)],
                )
                .map_err(unavailable)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(unavailable)?;
            Ok(())
        })
        .await
    }
}

/// Column values as stored, before validation.
struct RawRow {
    fingerprint: String,
    reservation_id: String,
    status: Option<i64>,
    content_type: Option<String>,
    body: Option<Vec<u8>>,
    created_at_ms: i64,
    expires_at_ms: i64,
    lease_expires_at_ms: i64,
}

fn select(conn: &Connection, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
    let raw = conn
        .query_row(SELECT, params![key.as_str()], |row| {
            Ok(RawRow {
                fingerprint: row.get(0)?,
                reservation_id: row.get(1)?,
                status: row.get(2)?,
                content_type: row.get(3)?,
                body: row.get(4)?,
                created_at_ms: row.get(5)?,
                expires_at_ms: row.get(6)?,
                lease_expires_at_ms: row.get(7)?,
            })
        })
        .optional()
        .map_err(unavailable)?;
    raw.map(|raw| decode(key.clone(), raw)).transpose()
}

fn decode(key: IdempotencyKey, raw: RawRow) -> Result<IdempotencyRecord, StoreError> {
    let reservation_id = Uuid::parse_str(&raw.reservation_id)
        .map_err(|e| StoreError::Corrupt(format!("reservation_id: {e}")))?;
    let response = match raw.status {
        None => None,
        Some(status) => Some(StoredResponse {
            status: u16::try_from(status)
                .map_err(|_| StoreError::Corrupt(format!("response_status out of range: {status}")))?,
            content_type: raw.content_type,
            body: Bytes::from(raw.body.unwrap_or_default()),
        }),
    };
    Ok(IdempotencyRecord {
        key,
        fingerprint: Fingerprint::from_stored(raw.fingerprint),
        reservation_id,
        response,
        created_at: from_millis(raw.created_at_ms)?,
        expires_at: from_millis(raw.expires_at_ms)?,
        lease_expires_at: from_millis(raw.lease_expires_at_ms)?,
    })
}

fn to_millis(t: OffsetDateTime) -> i64 {
    i64::try_from(t.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| StoreError::Corrupt(format!("timestamp {ms}: {e}")))
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}
