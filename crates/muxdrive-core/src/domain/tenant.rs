//! Tenant entity
//!
//! One tenant is one upstream cloud-drive credential pair (app id + app
//! secret) plus its quota accounting and routing metadata. The registry
//! keeps a total order over tenants via the `order` field; the router uses
//! it for deterministic write-target selection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TenantId;
use crate::errors::{EngineError, EngineResult};

/// Upstream API cluster a tenant belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// International cluster.
    #[default]
    Intl,
    /// Mainland-China cluster.
    Cn,
}

/// Whether writes may be routed to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantPermission {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// A registered cloud-drive tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub display_name: String,
    pub app_id: String,
    pub app_secret: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub quota_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub permission: TenantPermission,
    pub active: bool,
    /// Unique per registry; gives the total routing order.
    #[serde(default)]
    pub order: i32,
    /// Cached upstream access token, refreshed by the backend adapter.
    #[serde(default)]
    pub cached_access_token: Option<String>,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Creates a tenant with fresh id and empty token cache.
    pub fn new(
        display_name: String,
        app_id: String,
        app_secret: String,
        platform: Platform,
        quota_bytes: u64,
        order: i32,
    ) -> Self {
        Self {
            id: TenantId::new(),
            display_name,
            app_id,
            app_secret,
            platform,
            quota_bytes,
            used_bytes: 0,
            permission: TenantPermission::default(),
            active: true,
            order,
            cached_access_token: None,
            token_expiry: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.permission, TenantPermission::ReadOnly)
    }

    /// Errors with `ScopeDenied` if the tenant is configured read-only.
    pub fn ensure_writable(&self) -> EngineResult<()> {
        if self.is_read_only() {
            Err(EngineError::ScopeDenied(format!(
                "tenant '{}' is read-only",
                self.display_name
            )))
        } else {
            Ok(())
        }
    }

    /// True when the cached token is absent or expires within 30 minutes.
    pub fn needs_token_refresh(&self) -> bool {
        match (&self.cached_access_token, &self.token_expiry) {
            (Some(_), Some(expiry)) => *expiry - Utc::now() < Duration::minutes(30),
            _ => true,
        }
    }

    /// Free capacity in bytes. Overruns report zero rather than wrapping.
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }

    /// Copy of the record with the app secret removed, for listings.
    pub fn redacted(&self) -> Tenant {
        Tenant {
            app_secret: String::new(),
            cached_access_token: None,
            ..self.clone()
        }
    }
}
