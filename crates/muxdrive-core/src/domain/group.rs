//! Group entity
//!
//! A group is a named subset of tenants that shares one API key. Keys are
//! high-entropy opaque strings; regenerating a key leaves all other fields
//! intact.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{GroupId, TenantId};

/// A tenant group forming one API-key scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub tenant_ids: Vec<TenantId>,
    pub api_key: String,
}

impl Group {
    /// Creates a group with a freshly generated API key.
    pub fn new(name: String, remark: Option<String>, tenant_ids: Vec<TenantId>) -> Self {
        Self {
            id: GroupId::new(),
            name,
            remark,
            tenant_ids,
            api_key: generate_api_key(),
        }
    }

    pub fn contains(&self, tenant_id: &TenantId) -> bool {
        self.tenant_ids.contains(tenant_id)
    }

    /// Replaces the API key with a fresh one.
    pub fn regenerate_key(&mut self) {
        self.api_key = generate_api_key();
    }
}

/// Generates an opaque high-entropy API key (two dash-stripped UUIDv4s,
/// 64 hex chars).
pub fn generate_api_key() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
