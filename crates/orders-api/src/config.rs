//! Configuration loading and validation for the orders service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is missing or invalid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::idempotency::{IdempotencyPolicy, StoreBackend};
use crate::server::middleware::REQUEST_TIMEOUT;

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for span export. Export is disabled when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Which idempotency record store to build: `memory` or `sqlite`.
    #[serde(default)]
    pub idempotency_backend: StoreBackend,

    /// SQLite database file shared by all instances. **Required** for `sqlite`.
    #[serde(default)]
    pub idempotency_sqlite_path: Option<PathBuf>,

    /// How long (seconds) a recorded response is honoured.
    #[serde(default = "default_retention")]
    pub idempotency_retention_secs: u64,

    /// Lease (seconds) on an in-flight reservation before another request may take it over.
    #[serde(default = "default_in_flight_timeout")]
    pub idempotency_in_flight_timeout_secs: u64,

    /// How long (milliseconds) a duplicate waits for the in-flight original to finish.
    #[serde(default = "default_wait_timeout")]
    pub idempotency_wait_timeout_ms: u64,

    /// Largest request body (bytes) accepted for fingerprinting.
    #[serde(default = "default_max_body_bytes")]
    pub idempotency_max_body_bytes: usize,

    /// Deepest JSON nesting accepted for fingerprinting.
    #[serde(default = "default_max_body_depth")]
    pub idempotency_max_body_depth: usize,

    /// Largest response body (bytes) that will be recorded for replay.
    #[serde(default = "default_max_response_bytes")]
    pub idempotency_max_response_bytes: usize,

    /// How often (seconds) expired records are pruned from the store.
    #[serde(default = "default_prune_interval")]
    pub idempotency_prune_interval_secs: u64,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_retention() -> u64 {
    24 * 60 * 60
}
fn default_in_flight_timeout() -> u64 {
    60
}
fn default_wait_timeout() -> u64 {
    10_000
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_max_body_depth() -> usize {
    64
}
fn default_max_response_bytes() -> usize {
    1024 * 1024
}
fn default_prune_interval() -> u64 {
    300
}

/// serde_json fails to parse at 128 levels of nesting.
const MAX_SUPPORTED_DEPTH: usize = 127;

/// Ten years.
const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Derive the idempotency layer policy from the validated configuration.
    pub fn idempotency_policy(&self) -> IdempotencyPolicy {
        IdempotencyPolicy {
            retention: Duration::from_secs(self.idempotency_retention_secs),
            in_flight_timeout: Duration::from_secs(self.idempotency_in_flight_timeout_secs),
            wait_timeout: Duration::from_millis(self.idempotency_wait_timeout_ms),
            max_body_bytes: self.idempotency_max_body_bytes,
            max_body_depth: self.idempotency_max_body_depth,
            max_response_bytes: self.idempotency_max_response_bytes,
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.idempotency_backend == StoreBackend::Sqlite {
            match &self.idempotency_sqlite_path {
                Some(path) if !path.as_os_str().is_empty() => {}
                _ => anyhow::bail!(
                    "IDEMPOTENCY_SQLITE_PATH is required when IDEMPOTENCY_BACKEND=sqlite"
                ),
            }
        }
        if self.idempotency_retention_secs == 0
            || self.idempotency_retention_secs > MAX_RETENTION_SECS
        {
            anyhow::bail!("IDEMPOTENCY_RETENTION_SECS must be between 1 and {MAX_RETENTION_SECS}");
        }
        if self.idempotency_in_flight_timeout_secs <= REQUEST_TIMEOUT.as_secs() {
            anyhow::bail!(
                "IDEMPOTENCY_IN_FLIGHT_TIMEOUT_SECS must exceed the {}s request timeout",
                REQUEST_TIMEOUT.as_secs()
            );
        }
        if self.idempotency_in_flight_timeout_secs > self.idempotency_retention_secs {
            anyhow::bail!(
                "IDEMPOTENCY_IN_FLIGHT_TIMEOUT_SECS must not exceed IDEMPOTENCY_RETENTION_SECS"
            );
        }
        if self.idempotency_wait_timeout_ms / 1000 > self.idempotency_in_flight_timeout_secs {
            anyhow::bail!(
                "IDEMPOTENCY_WAIT_TIMEOUT_MS must not exceed IDEMPOTENCY_IN_FLIGHT_TIMEOUT_SECS"
            );
        }
        if self.idempotency_max_body_bytes == 0 {
            anyhow::bail!("IDEMPOTENCY_MAX_BODY_BYTES must be > 0");
        }
        if self.idempotency_max_body_depth == 0
            || self.idempotency_max_body_depth > MAX_SUPPORTED_DEPTH
        {
            anyhow::bail!("IDEMPOTENCY_MAX_BODY_DEPTH must be between 1 and {MAX_SUPPORTED_DEPTH}");
        }
        if self.idempotency_prune_interval_secs == 0 {
            anyhow::bail!("IDEMPOTENCY_PRUNE_INTERVAL_SECS must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            otel_exporter_otlp_endpoint: None,
            idempotency_backend: StoreBackend::Memory,
            idempotency_sqlite_path: None,
            idempotency_retention_secs: default_retention(),
            idempotency_in_flight_timeout_secs: default_in_flight_timeout(),
            idempotency_wait_timeout_ms: default_wait_timeout(),
            idempotency_max_body_bytes: default_max_body_bytes(),
            idempotency_max_body_depth: default_max_body_depth(),
            idempotency_max_response_bytes: default_max_response_bytes(),
            idempotency_prune_interval_secs: default_prune_interval(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_listen_port(), 8080);
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_retention(), 86_400);
        assert_eq!(default_in_flight_timeout(), 60);
        assert_eq!(default_max_body_bytes(), 1_048_576);
        assert_eq!(default_max_body_depth(), 64);
        assert_eq!(StoreBackend::default(), StoreBackend::Memory);
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_sqlite_without_path() {
        let cfg = Config {
            idempotency_backend: StoreBackend::Sqlite,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            idempotency_backend: StoreBackend::Sqlite,
            idempotency_sqlite_path: Some("/var/lib/orders/idempotency.db".into()),
            ..valid()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let cfg = Config {
            idempotency_retention_secs: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unbounded_retention() {
        let cfg = Config {
            idempotency_retention_secs: u64::MAX,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            idempotency_retention_secs: MAX_RETENTION_SECS,
            ..valid()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_lease_longer_than_retention() {
        let cfg = Config {
            idempotency_retention_secs: 120,
            idempotency_in_flight_timeout_secs: 600,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            idempotency_in_flight_timeout_secs: u64::MAX,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_wait_longer_than_lease() {
        let cfg = Config {
            idempotency_wait_timeout_ms: u64::MAX,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_lease_shorter_than_request_timeout() {
        let cfg = Config {
            idempotency_in_flight_timeout_secs: 10,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsupported_depth() {
        let cfg = Config {
            idempotency_max_body_depth: 500,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            idempotency_max_body_depth: 128,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            idempotency_max_body_depth: 127,
            ..valid()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn policy_reflects_config() {
        let policy = valid().idempotency_policy();
        assert_eq!(policy.retention, Duration::from_secs(86_400));
        assert_eq!(policy.wait_timeout, Duration::from_secs(10));
        assert_eq!(policy.max_body_depth, 64);
    }
}
