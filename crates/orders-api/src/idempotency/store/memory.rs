//! [`MemoryRecordStore`]: volatile, process-local record store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RecordStore, Reservation, StoreBackend, StoreError};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::record::{IdempotencyRecord, StoredResponse};

/// Process-memory record store.
///
/// Every operation holds the map lock for its whole check-and-modify step, so
/// `create` is a true insert-if-absent within this process. State is lost on
/// restart and is not visible to other instances.
#[derive(Clone, Debug, Default)]
pub struct MemoryRecordStore {
    inner: Arc<Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>>,
}

impl MemoryRecordStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, including expired ones not yet pruned.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn create(&self, record: &IdempotencyRecord) -> Result<Reservation, StoreError> {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&record.key) {
            if !existing.is_replaceable_by(&record.fingerprint, record.created_at) {
                return Ok(Reservation::Existing(existing.clone()));
            }
        }
        map.insert(record.key.clone(), record.clone());
        Ok(Reservation::Acquired)
    }

    async fn finalize(
        &self,
        key: &IdempotencyKey,
        reservation_id: Uuid,
        response: &StoredResponse,
    ) -> Result<(), StoreError> {
        let mut map = self.inner.lock().await;
        match map.get_mut(key) {
            Some(r) if r.reservation_id == reservation_id && r.response.is_none() => {
                r.response = Some(response.clone());
                Ok(())
            }
            _ => Err(StoreError::ReservationLost),
        }
    }

    async fn release(&self, key: &IdempotencyKey, reservation_id: Uuid) -> Result<(), StoreError> {
        let mut map = self.inner.lock().await;
        let owned = map
            .get(key)
            .is_some_and(|r| r.reservation_id == reservation_id && r.response.is_none());
        if owned {
            map.remove(key);
        }
        Ok(())
    }

    async fn lookup(
        &self,
        key: &IdempotencyKey,
        now: OffsetDateTime,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let map = self.inner.lock().await;
        Ok(map.get(key).filter(|r| !self.is_expired(r, now)).cloned())
    }

    async fn prune_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, r| !r.is_expired(now));
        Ok((before - map.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::fingerprint::Fingerprint;
    use bytes::Bytes;
    use std::time::Duration;

    fn reservation(key: &IdempotencyKey, fp: &str, now: OffsetDateTime) -> IdempotencyRecord {
        IdempotencyRecord::reserve(
            key.clone(),
            Fingerprint::from_stored(fp.into()),
            now,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn created() -> StoredResponse {
        StoredResponse {
            status: 201,
            content_type: Some("application/json".into()),
            body: Bytes::from_static(br#"{"id":"1"}"#),
        }
    }

    #[tokio::test]
    async fn first_create_acquires_second_sees_existing() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            store.create(&reservation(&key, "aa", now)).await.unwrap(),
            Reservation::Acquired
        );
        let second = store.create(&reservation(&key, "aa", now)).await.unwrap();
        assert!(matches!(second, Reservation::Existing(r) if r.response.is_none()));
    }

    #[tokio::test]
    async fn finalize_then_lookup_returns_response() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        let rec = reservation(&key, "aa", now);
        store.create(&rec).await.unwrap();
        store
            .finalize(&key, rec.reservation_id, &created())
            .await
            .unwrap();
        let found = store.lookup(&key, now).await.unwrap().unwrap();
        assert_eq!(found.response, Some(created()));
    }

    #[tokio::test]
    async fn finalized_record_is_immutable() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        let rec = reservation(&key, "aa", now);
        store.create(&rec).await.unwrap();
        store.finalize(&key, rec.reservation_id, &created()).await.unwrap();
        let again = store.finalize(&key, rec.reservation_id, &created()).await;
        assert!(matches!(again, Err(StoreError::ReservationLost)));
        // Releasing a finalized record is a no-op.
        store.release(&key, rec.reservation_id).await.unwrap();
        assert!(store.lookup(&key, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        let rec = reservation(&key, "aa", now);
        store.create(&rec).await.unwrap();
        store.release(&key, rec.reservation_id).await.unwrap();
        assert!(store.lookup(&key, now).await.unwrap().is_none());
        assert_eq!(
            store.create(&reservation(&key, "bb", now)).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn release_by_non_owner_is_ignored() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        store.create(&reservation(&key, "aa", now)).await.unwrap();
        store.release(&key, Uuid::new_v4()).await.unwrap();
        assert!(store.lookup(&key, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent_and_is_replaced() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        let rec = reservation(&key, "aa", now);
        store.create(&rec).await.unwrap();
        store.finalize(&key, rec.reservation_id, &created()).await.unwrap();

        let later = now + Duration::from_secs(61);
        assert!(store.lookup(&key, later).await.unwrap().is_none());
        assert_eq!(
            store.create(&reservation(&key, "bb", later)).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn stale_reservation_taken_over_only_by_same_fingerprint() {
        let store = MemoryRecordStore::new();
        let key = IdempotencyKey::random();
        let now = OffsetDateTime::now_utc();
        store.create(&reservation(&key, "aa", now)).await.unwrap();

        let later = now + Duration::from_secs(6);
        assert!(matches!(
            store.create(&reservation(&key, "bb", later)).await.unwrap(),
            Reservation::Existing(_)
        ));
        assert_eq!(
            store.create(&reservation(&key, "aa", later)).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let store = MemoryRecordStore::new();
        let now = OffsetDateTime::now_utc();
        let old = IdempotencyKey::random();
        let fresh = IdempotencyKey::random();
        store.create(&reservation(&old, "aa", now)).await.unwrap();
        store
            .create(&reservation(&fresh, "aa", now + Duration::from_secs(30)))
            .await
            .unwrap();

        let removed = store.prune_expired(now + Duration::from_secs(61)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }
}
