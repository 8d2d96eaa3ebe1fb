//! Request fingerprinting: a stable digest of method, path and canonical body.
//!
//! JSON bodies are re-serialised with RFC 8785 (JCS) canonicalisation before
//! hashing, so two bodies that differ only in object key order or insignificant
//! whitespace produce the same fingerprint. Non-JSON bodies are hashed as raw
//! bytes under a distinct tag.
//!
//! Nesting depth is checked with a linear scan *before* any recursive parsing,
//! so pathological inputs are rejected without touching the stack.

use std::fmt;

use axum::http::Method;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while fingerprinting a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    /// The JSON body nests deeper than the configured bound.
    #[error("body nesting exceeds {max} levels")]
    TooDeep {
        /// Configured bound.
        max: usize,
    },
}

/// Hex-encoded SHA-256 request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Rebuild a fingerprint read back from storage.
    pub fn from_stored(hex: String) -> Self {
        Self(hex)
    }

    /// Borrow the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the body contributed to the digest.
enum BodyKind {
    Empty,
    Json(Vec<u8>),
    Raw,
}

impl BodyKind {
    fn tag(&self) -> &'static [u8] {
        match self {
            BodyKind::Empty => b"empty",
            BodyKind::Json(_) => b"json",
            BodyKind::Raw => b"raw",
        }
    }
}

/// Computes request fingerprints under a nesting bound.
#[derive(Debug, Clone, Copy)]
pub struct RequestFingerprinter {
    max_depth: usize,
}

impl RequestFingerprinter {
    /// Create a fingerprinter that rejects bodies nested deeper than `max_depth`.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Fingerprint a request.
    ///
    /// Body size is bounded by the caller while reading; this function only
    /// enforces the nesting bound.
    ///
    /// # Errors
    ///
    /// Returns [`FingerprintError::TooDeep`] if the body nests beyond the bound.
    pub fn fingerprint(
        &self,
        method: &Method,
        path: &str,
        body: &[u8],
    ) -> Result<Fingerprint, FingerprintError> {
        let kind = self.classify_body(body)?;

        let mut hasher = Sha256::new();
        update_framed(&mut hasher, method.as_str().as_bytes());
        update_framed(&mut hasher, path.as_bytes());
        update_framed(&mut hasher, kind.tag());
        match &kind {
            BodyKind::Empty => {}
            BodyKind::Json(canonical) => update_framed(&mut hasher, canonical),
            BodyKind::Raw => update_framed(&mut hasher, body),
        }
        Ok(Fingerprint(hex_encode(&hasher.finalize())))
    }

    fn classify_body(&self, body: &[u8]) -> Result<BodyKind, FingerprintError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(BodyKind::Empty);
        }
        if nesting_depth(body) > self.max_depth {
            return Err(FingerprintError::TooDeep {
                max: self.max_depth,
            });
        }
        let canonical = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|value| serde_jcs::to_vec(&value).ok());
        Ok(match canonical {
            Some(bytes) => BodyKind::Json(bytes),
            None => BodyKind::Raw,
        })
    }
}

/// Length-prefix each field so adjacent fields can never run together.
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Maximum bracket nesting of a JSON-ish byte string, ignoring brackets inside strings.
fn nesting_depth(bytes: &[u8]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for &b in bytes {
        if in_string {
            match (escaped, b) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max = max.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[usize::from(b >> 4)]));
        out.push(char::from(HEX[usize::from(b & 0x0f)]));
    }
    out
}
