//! `Idempotency-Key` header classification.

use std::fmt;

use axum::http::HeaderValue;
use uuid::{Uuid, Variant, Version};

/// Length of the canonical hyphenated UUID form (8-4-4-4-12).
const CANONICAL_LEN: usize = 36;
/// Byte offsets of the four hyphens in the canonical form.
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// A validated idempotency key, normalised to lowercase hyphenated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Borrow the normalised key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A fresh random key, for tests.
    #[cfg(test)]
    pub fn random() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of inspecting the raw header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheck {
    /// No header, or an empty one. The request is not protected.
    NoKey,
    /// A canonical v4 UUID.
    Valid(IdempotencyKey),
    /// Present but malformed.
    Invalid,
}

/// Classify the raw `Idempotency-Key` header value.
pub fn classify(raw: Option<&HeaderValue>) -> KeyCheck {
    let Some(raw) = raw else {
        return KeyCheck::NoKey;
    };
    let Ok(value) = raw.to_str() else {
        return KeyCheck::Invalid;
    };
    let value = value.trim();
    if value.is_empty() {
        return KeyCheck::NoKey;
    }
    match parse_v4(value) {
        Some(uuid) => KeyCheck::Valid(IdempotencyKey(uuid.hyphenated().to_string())),
        None => KeyCheck::Invalid,
    }
}

/// Accept only the 36-character hyphenated form with version 4 and the RFC 4122 variant.
///
/// `Uuid::try_parse` alone also accepts simple, braced and URN forms.
fn parse_v4(value: &str) -> Option<Uuid> {
    let bytes = value.as_bytes();
    if bytes.len() != CANONICAL_LEN || HYPHENS.iter().any(|&i| bytes[i] != b'-') {
        return None;
    }
    let uuid = Uuid::try_parse(value).ok()?;
    if uuid.get_version() != Some(Version::Random) || uuid.get_variant() != Variant::RFC4122 {
        return None;
    }
    Some(uuid)
}
