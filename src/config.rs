//! Configuration structures for the hybrid store.
//!
//! Loading these from a file, environment variables, or a preset-merge
//! pipeline is out of scope here — callers construct a [`HybridConfig`]
//! directly (or via `Default`) and pass it to [`crate::HybridStore::new`].
//! [`HybridConfig::validate`] enforces the invariants a config loader would
//! otherwise need to check upstream.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Per-record time-to-live settings, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Fallback TTL applied when no field-specific TTL is set.
    pub default_ttl: u64,
    /// TTL for the `creds` portion of a snapshot.
    pub creds_ttl: u64,
    /// TTL for the `keys` portion of a snapshot.
    pub keys_ttl: u64,
    /// TTL for entries in the per-session lock table.
    pub lock_ttl: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_ttl: 30 * 24 * 3600,
            creds_ttl: 30 * 24 * 3600,
            keys_ttl: 90 * 24 * 3600,
            lock_ttl: 1800,
        }
    }
}

/// Timeout and retry behavior for durable-tier calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-operation timeout, in milliseconds.
    pub operation_timeout_ms: u64,
    /// Maximum retry attempts for durable-tier conflicts.
    pub max_retries: u32,
    /// Initial retry delay, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Exponential backoff multiplier applied between retries.
    pub retry_multiplier: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 3_000,
            max_retries: 3,
            retry_base_delay_ms: 50,
            retry_multiplier: 2.0,
        }
    }
}

/// Supported AEAD algorithms for the codec boundary (not implemented here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    /// XSalsa20-Poly1305-style secretbox construction.
    AeadSecretbox,
    /// AES-256 in GCM mode.
    Aes256Gcm,
}

/// Supported compression algorithms for the codec boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Snappy.
    Snappy,
    /// Gzip.
    Gzip,
}

/// Deployment environment, used only to gate stricter validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    Development,
    /// Automated tests.
    Test,
    /// Production.
    Production,
}

/// Encryption, compression, and key-rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Whether the durable-tier codec should encrypt field bytes.
    pub enable_encryption: bool,
    /// Whether the durable-tier codec should compress field bytes.
    pub enable_compression: bool,
    /// Algorithm to use when encryption is enabled.
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Algorithm to use when compression is enabled.
    pub compression_algorithm: CompressionAlgorithm,
    /// How often encryption keys should be rotated, in days.
    pub key_rotation_days: u32,
    /// Deployment environment.
    pub environment: Environment,
    /// 64 hex character master key, required iff `enable_encryption`.
    pub master_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_encryption: false,
            enable_compression: false,
            encryption_algorithm: EncryptionAlgorithm::Aes256Gcm,
            compression_algorithm: CompressionAlgorithm::Snappy,
            key_rotation_days: 30,
            environment: Environment::Development,
            master_key: None,
        }
    }
}

/// Logging, metrics, and tracing toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Whether to maintain the metrics registry.
    pub enable_metrics: bool,
    /// Whether to emit tracing spans around tier calls.
    pub enable_tracing: bool,
    /// Whether to log at a more verbose level.
    pub enable_detailed_logs: bool,
    /// How often periodic metrics snapshots are taken, in milliseconds.
    pub metrics_interval_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_tracing: false,
            enable_detailed_logs: false,
            metrics_interval_ms: 10_000,
        }
    }
}

/// Top-level configuration for [`crate::HybridStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    /// TTL settings.
    pub ttl: TtlConfig,
    /// Timeout/retry settings.
    pub resilience: ResilienceConfig,
    /// Encryption/compression settings.
    pub security: SecurityConfig,
    /// Logging/metrics/tracing toggles.
    pub observability: ObservabilityConfig,
    /// Whether writes go through the outbox + queue instead of a blocking
    /// direct durable-tier write.
    pub enable_write_behind: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            ttl: TtlConfig::default(),
            resilience: ResilienceConfig::default(),
            security: SecurityConfig::default(),
            observability: ObservabilityConfig::default(),
            enable_write_behind: true,
        }
    }
}

impl HybridConfig {
    /// Validate the invariants spelled out in the Config error taxonomy:
    /// TTLs at least 1 second, a sane operation timeout window, a bounded
    /// retry count, a non-degenerate backoff multiplier, and — when
    /// encryption is enabled — a rotation period and a well-formed master
    /// key.
    pub fn validate(&self) -> StoreResult<()> {
        for (name, value) in [
            ("ttl.default_ttl", self.ttl.default_ttl),
            ("ttl.creds_ttl", self.ttl.creds_ttl),
            ("ttl.keys_ttl", self.ttl.keys_ttl),
            ("ttl.lock_ttl", self.ttl.lock_ttl),
        ] {
            if value < 1 {
                return Err(StoreError::Config(format!("{name} must be >= 1 second")));
            }
        }

        let timeout = self.resilience.operation_timeout_ms;
        if !(100..=60_000).contains(&timeout) {
            return Err(StoreError::Config(
                "resilience.operation_timeout_ms must be in [100, 60000]".into(),
            ));
        }

        if self.resilience.max_retries > 10 {
            return Err(StoreError::Config(
                "resilience.max_retries must be <= 10".into(),
            ));
        }

        if self.resilience.retry_multiplier < 1.0 {
            return Err(StoreError::Config(
                "resilience.retry_multiplier must be >= 1.0".into(),
            ));
        }

        if self.security.enable_encryption {
            if self.security.key_rotation_days < 1 {
                return Err(StoreError::Config(
                    "security.key_rotation_days must be >= 1 when encryption is enabled".into(),
                ));
            }

            let key = self.security.master_key.as_deref().unwrap_or("");
            if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(StoreError::Config(
                    "security.master_key must be 64 hex characters when encryption is enabled"
                        .into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(HybridConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = HybridConfig::default();
        config.ttl.default_ttl = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut config = HybridConfig::default();
        config.resilience.operation_timeout_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_retries() {
        let mut config = HybridConfig::default();
        config.resilience.max_retries = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_master_key_when_encryption_enabled() {
        let mut config = HybridConfig::default();
        config.security.enable_encryption = true;
        assert!(config.validate().is_err());

        config.security.master_key = Some("a".repeat(64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_master_key() {
        let mut config = HybridConfig::default();
        config.security.enable_encryption = true;
        config.security.master_key = Some("not-hex".to_string());
        assert!(config.validate().is_err());
    }
}
