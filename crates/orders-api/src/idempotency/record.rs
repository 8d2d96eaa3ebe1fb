//! Idempotency records: the unit of persisted state.

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::fingerprint::Fingerprint;
use super::key::IdempotencyKey;

/// A retention or lease window that runs past the representable calendar.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("idempotency window of {0:?} overflows the calendar")]
pub struct WindowOverflow(pub std::time::Duration);

/// The response produced the first time an operation ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header, if the handler set one.
    pub content_type: Option<String>,
    /// Body bytes, replayed verbatim.
    pub body: Bytes,
}

/// A reservation or finalized record for one idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// The client-supplied key.
    pub key: IdempotencyKey,
    /// Fingerprint of the request that first used the key.
    pub fingerprint: Fingerprint,
    /// Identifies the request currently owning an in-flight reservation.
    pub reservation_id: Uuid,
    /// `None` while the first request is still running.
    pub response: Option<StoredResponse>,
    /// Time of first use.
    pub created_at: OffsetDateTime,
    /// After this instant the record is no longer honoured.
    pub expires_at: OffsetDateTime,
    /// After this instant an unfinished reservation is considered abandoned.
    pub lease_expires_at: OffsetDateTime,
}

impl IdempotencyRecord {
    /// A new, unfinished reservation.
    ///
    /// # Errors
    ///
    /// Returns [`WindowOverflow`] if `now` plus either window is not a valid date.
    pub fn reserve(
        key: IdempotencyKey,
        fingerprint: Fingerprint,
        now: OffsetDateTime,
        retention: std::time::Duration,
        lease: std::time::Duration,
    ) -> Result<Self, WindowOverflow> {
        Ok(Self {
            key,
            fingerprint,
            reservation_id: Uuid::new_v4(),
            response: None,
            created_at: now,
            expires_at: deadline(now, retention)?,
            lease_expires_at: deadline(now, lease)?,
        })
    }

    /// True once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// True for an unfinished reservation whose lease has run out.
    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.response.is_none() && now >= self.lease_expires_at
    }

    /// Whether a new reservation for the same key may replace this record.
    ///
    /// Expired records are always replaceable. Abandoned reservations are only
    /// replaceable by a request with the same fingerprint, so a key never maps
    /// to two different requests while live.
    pub fn is_replaceable_by(&self, fingerprint: &Fingerprint, now: OffsetDateTime) -> bool {
        self.is_expired(now) || (self.is_stale(now) && self.fingerprint == *fingerprint)
    }
}

fn deadline(
    now: OffsetDateTime,
    window: std::time::Duration,
) -> Result<OffsetDateTime, WindowOverflow> {
    time::Duration::try_from(window)
        .ok()
        .and_then(|w| now.checked_add(w))
        .ok_or(WindowOverflow(window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(now: OffsetDateTime) -> IdempotencyRecord {
        IdempotencyRecord::reserve(
            IdempotencyKey::random(),
            Fingerprint::from_stored("aa".into()),
            now,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn unrepresentable_window_is_an_error() {
        let err = IdempotencyRecord::reserve(
            IdempotencyKey::random(),
            Fingerprint::from_stored("aa".into()),
            OffsetDateTime::now_utc(),
            Duration::from_secs(u64::MAX),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err, WindowOverflow(Duration::from_secs(u64::MAX)));

        assert!(IdempotencyRecord::reserve(
            IdempotencyKey::random(),
            Fingerprint::from_stored("aa".into()),
            OffsetDateTime::now_utc(),
            Duration::from_secs(60),
            Duration::from_secs(400 * 365 * 24 * 60 * 60 * 100),
        )
        .is_err());
    }

    #[test]
    fn expiry_is_after_creation() {
        let now = OffsetDateTime::now_utc();
        let r = record(now);
        assert!(r.expires_at > r.created_at);
        assert!(!r.is_expired(now));
        assert!(r.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn stale_only_while_unfinished() {
        let now = OffsetDateTime::now_utc();
        let mut r = record(now);
        let later = now + Duration::from_secs(10);
        assert!(r.is_stale(later));
        r.response = Some(StoredResponse {
            status: 201,
            content_type: None,
            body: Bytes::from_static(b"{}"),
        });
        assert!(!r.is_stale(later));
    }

    #[test]
    fn stale_reservation_needs_matching_fingerprint() {
        let now = OffsetDateTime::now_utc();
        let r = record(now);
        let later = now + Duration::from_secs(10);
        assert!(r.is_replaceable_by(&Fingerprint::from_stored("aa".into()), later));
        assert!(!r.is_replaceable_by(&Fingerprint::from_stored("bb".into()), later));
        assert!(!r.is_replaceable_by(&Fingerprint::from_stored("aa".into()), now));
    }
}
