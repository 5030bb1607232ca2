//! Access scopes
//!
//! An API key resolves to either the process-wide admin scope or one
//! group's scope. Scoped keys see only their group's tenants; admin sees
//! the universe.

use muxdrive_core::domain::GroupId;
use muxdrive_core::{EngineError, EngineResult};
use sha2::{Digest, Sha256};

/// Resolved authorization context of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    Admin,
    Group(GroupId),
}

impl AccessScope {
    pub fn is_admin(&self) -> bool {
        matches!(self, AccessScope::Admin)
    }

    /// Errors unless the scope is admin.
    pub fn ensure_admin(&self) -> EngineResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::ScopeDenied("admin key required".into()))
        }
    }

    /// Label recorded in the audit log.
    pub fn label(&self) -> String {
        match self {
            AccessScope::Admin => "admin".into(),
            AccessScope::Group(id) => format!("group:{id}"),
        }
    }
}

/// SHA-256 hex digest used for at-rest admin key comparison.
pub fn digest_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}
