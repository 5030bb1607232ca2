//! Engine configuration document (`config.json`)
//!
//! Configuration is exposed exclusively through the document store;
//! environment variables are not consulted. Every section carries serde
//! defaults so older documents deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Default gateway port.
pub const DEFAULT_API_PORT: u16 = 6688;
/// Default gateway request timeout in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 120;
/// Default audit log size cap in megabytes.
pub const DEFAULT_LOG_MAX_MB: u64 = 100;
/// Allowed audit log cap range in megabytes.
pub const LOG_MAX_MB_RANGE: (u64, u64) = (5, 2048);

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: ApiLogConfig,
}

/// Gateway listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub listen_host: String,
    pub port: u16,
    pub timeout_secs: u64,
    /// Start the listener when the daemon boots.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            port: DEFAULT_API_PORT,
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            autostart: true,
        }
    }
}

/// Admin key material. The digest is authoritative; the plaintext is kept
/// so the local operator can read the key back through an admin command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub admin_key_digest: Option<String>,
    #[serde(default)]
    pub admin_key_plain: Option<String>,
}

/// Transfer engine limits and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent workers per direction.
    pub workers_per_direction: usize,
    /// Concurrent transfers against one tenant.
    pub per_tenant_parallelism: usize,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_attempts: u32,
    /// Block size for ranged downloads, in bytes.
    pub download_block_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers_per_direction: 3,
            per_tenant_parallelism: 2,
            retry_base_ms: 500,
            retry_cap_ms: 10_000,
            retry_attempts: 5,
            download_block_size: 4 * 1024 * 1024,
        }
    }
}

/// Backend adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Deadline for each upstream call, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
        }
    }
}

/// Audit log location and retention cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLogConfig {
    /// Override directory; defaults to `<data_dir>/api_logs`.
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_log_max_mb")]
    pub max_size_mb: u64,
}

impl Default for ApiLogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_size_mb: DEFAULT_LOG_MAX_MB,
        }
    }
}

impl ApiLogConfig {
    /// Size cap clamped to the permitted 5-2048 MB range.
    pub fn clamped_max_mb(&self) -> u64 {
        self.max_size_mb
            .clamp(LOG_MAX_MB_RANGE.0, LOG_MAX_MB_RANGE.1)
    }
}

fn default_true() -> bool {
    true
}

fn default_log_max_mb() -> u64 {
    DEFAULT_LOG_MAX_MB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.service.port, 6688);
        assert_eq!(cfg.service.timeout_secs, 120);
        assert!(cfg.service.autostart);
        assert_eq!(cfg.transfer.workers_per_direction, 3);
        assert_eq!(cfg.transfer.per_tenant_parallelism, 2);
        assert_eq!(cfg.transfer.retry_attempts, 5);
        assert_eq!(cfg.backend.request_timeout_secs, 60);
        assert_eq!(cfg.logging.max_size_mb, 100);
    }

    #[test]
    fn test_empty_document_deserializes() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.service.listen_host, "0.0.0.0");
        assert!(cfg.security.admin_key_digest.is_none());
    }

    #[test]
    fn test_log_cap_clamps() {
        let mut cfg = ApiLogConfig::default();
        cfg.max_size_mb = 1;
        assert_eq!(cfg.clamped_max_mb(), 5);
        cfg.max_size_mb = 10_000;
        assert_eq!(cfg.clamped_max_mb(), 2048);
        cfg.max_size_mb = 512;
        assert_eq!(cfg.clamped_max_mb(), 512);
    }
}
