//! Structured logging and optional OpenTelemetry span export.
//!
//! # Telemetry invariants
//!
//! - Request and response bodies never appear in any span attribute or log field.
//! - Idempotency keys may be logged; they are opaque client-chosen identifiers.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::init_telemetry;
