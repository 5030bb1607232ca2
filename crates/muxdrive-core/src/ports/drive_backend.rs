//! Cloud drive backend port
//!
//! Abstract boundary to the upstream cloud drive. The engine never speaks
//! a wire format directly; the router, transfer engine, and sync runner
//! consume this trait. Implementations own their token refresh and
//! rate-limit handling and surface failures as the typed upstream variants
//! of [`crate::EngineError`].
//!
//! Idempotence contract: `upload_block` is idempotent on
//! `(upload_id, seq)`; re-sending a durable block is harmless. A server
//! may return short reads from `download_range`; callers loop until the
//! requested range is exhausted or an empty read signals end of file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Tenant;
use crate::errors::EngineResult;

/// Entry type within a drive folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File,
    Doc,
    Sheet,
    #[serde(other)]
    Other,
}

impl EntryKind {
    pub fn is_folder(&self) -> bool {
        matches!(self, EntryKind::Folder)
    }

    /// Wire name used by delete/type query parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Folder => "folder",
            EntryKind::File => "file",
            EntryKind::Doc => "doc",
            EntryKind::Sheet => "sheet",
            EntryKind::Other => "file",
        }
    }
}

/// One entry of a folder listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub token: String,
    pub name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub parent_token: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
}

/// Root folder token plus its immediate children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootListing {
    pub root_token: String,
    pub entries: Vec<RemoteEntry>,
}

/// Metadata for a single token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Handle for a chunked upload in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    /// Block size the server expects; the final block may be shorter.
    pub block_size: u64,
}

/// Quota report for one tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Abstract remote drive operations.
#[async_trait::async_trait]
pub trait DriveBackend: Send + Sync {
    /// Resolves a tenant's root folder token and lists its children.
    async fn list_root(&self, tenant: &Tenant) -> EngineResult<RootListing>;

    /// Lists the children of a folder.
    async fn list_folder(
        &self,
        tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>>;

    /// Fetches metadata for one token.
    async fn metadata(&self, tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata>;

    /// Creates a folder under `parent_token` and returns its token.
    async fn create_folder(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String>;

    /// Moves an entry under a new parent.
    async fn move_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
    ) -> EngineResult<()>;

    /// Copies an entry under a new parent with a new name; returns the
    /// token of the copy.
    async fn copy_entry(
        &self,
        tenant: &Tenant,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String>;

    /// Renames an entry in place.
    async fn rename_entry(&self, tenant: &Tenant, token: &str, new_name: &str)
        -> EngineResult<()>;

    /// Deletes an entry. `kind` selects the upstream delete route.
    async fn delete_entry(&self, tenant: &Tenant, token: &str, kind: EntryKind)
        -> EngineResult<()>;

    /// Opens a chunked upload for a file of `size` bytes.
    async fn upload_init(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        size: u64,
    ) -> EngineResult<UploadSession>;

    /// Sends one block. Idempotent on `(upload_id, seq)`.
    async fn upload_block(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()>;

    /// Seals the upload and returns the new file token.
    async fn upload_finish(
        &self,
        tenant: &Tenant,
        upload_id: &str,
        block_count: u64,
    ) -> EngineResult<String>;

    /// Best-effort abort of an open upload session.
    async fn upload_abort(&self, tenant: &Tenant, upload_id: &str) -> EngineResult<()>;

    /// Reads up to `len` bytes at `offset`. May return fewer bytes than
    /// requested; an empty result signals end of file.
    async fn download_range(
        &self,
        tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>>;

    /// Current quota usage for the tenant.
    async fn quota(&self, tenant: &Tenant) -> EngineResult<QuotaUsage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_wire_names() {
        assert_eq!(EntryKind::Folder.as_str(), "folder");
        assert_eq!(EntryKind::Other.as_str(), "file");
        assert!(EntryKind::Folder.is_folder());
        assert!(!EntryKind::Doc.is_folder());
    }

    #[test]
    fn test_unknown_kind_deserializes_as_other() {
        let kind: EntryKind = serde_json::from_str("\"bitable\"").unwrap();
        assert_eq!(kind, EntryKind::Other);
    }

    #[test]
    fn test_remote_entry_optional_fields() {
        let entry: RemoteEntry = serde_json::from_value(serde_json::json!({
            "token": "tok_1",
            "name": "report.pdf",
            "kind": "file"
        }))
        .unwrap();
        assert!(entry.size.is_none());
        assert!(entry.mtime.is_none());
        assert!(entry.parent_token.is_none());
    }
}
