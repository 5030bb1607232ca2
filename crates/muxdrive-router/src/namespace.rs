//! Remote namespace operations
//!
//! Scope-checked folder/file commands that sit above the backend: create,
//! delete, move, copy, rename, and recursive name search. Name uniqueness
//! within a parent folder is asserted here before any write reaches the
//! backend.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use muxdrive_core::ports::{EntryKind, RemoteEntry};
use muxdrive_core::{EngineError, EngineResult};

use crate::registry::TenantRegistry;
use crate::scope::AccessScope;

/// A search hit annotated with its path from the search root.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: RemoteEntry,
    pub path: String,
    pub tenant_name: String,
}

/// Namespace-level commands over the federated drive.
pub struct NamespaceService {
    registry: Arc<TenantRegistry>,
}

impl NamespaceService {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Creates a folder, rejecting duplicate names under the parent.
    pub async fn create_folder(
        &self,
        scope: &AccessScope,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        let name = validate_node_name(name)?;
        let tenant = self.registry.tenant_for_token(scope, parent_token).await?;
        tenant.ensure_writable()?;
        self.registry
            .assert_unique_name(&tenant, parent_token, &name)
            .await?;
        let token = self
            .registry
            .backend()
            .create_folder(&tenant, parent_token, &name)
            .await?;
        self.registry
            .store()
            .resources
            .register(token.clone(), tenant.id)
            .await?;
        info!(parent = parent_token, name = %name, "Folder created");
        Ok(token)
    }

    /// Deletes an entry and forgets its resource mapping.
    pub async fn delete_entry(
        &self,
        scope: &AccessScope,
        token: &str,
        kind: EntryKind,
    ) -> EngineResult<()> {
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        tenant.ensure_writable()?;
        self.registry
            .backend()
            .delete_entry(&tenant, token, kind)
            .await?;
        self.registry.store().resources.remove(token).await?;
        Ok(())
    }

    /// Moves an entry under a new parent within the same tenant.
    pub async fn move_entry(
        &self,
        scope: &AccessScope,
        token: &str,
        new_parent: &str,
    ) -> EngineResult<()> {
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        let parent_tenant = self.registry.assert_scope_for_token(scope, new_parent).await?;
        if parent_tenant != tenant.id {
            // Cross-tenant moves are copy-then-delete orchestrated above
            // the backend; a single move never crosses tenants.
            return Err(EngineError::InvalidArgument(
                "move target belongs to a different tenant".into(),
            ));
        }
        tenant.ensure_writable()?;
        let name = self.entry_name(scope, token).await?;
        self.registry
            .assert_unique_name(&tenant, new_parent, &name)
            .await?;
        self.registry
            .backend()
            .move_entry(&tenant, token, new_parent)
            .await
    }

    /// Copies an entry under a new parent with a new name.
    pub async fn copy_entry(
        &self,
        scope: &AccessScope,
        token: &str,
        new_parent: &str,
        new_name: &str,
    ) -> EngineResult<String> {
        let new_name = validate_node_name(new_name)?;
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        let parent_tenant = self.registry.assert_scope_for_token(scope, new_parent).await?;
        if parent_tenant != tenant.id {
            return Err(EngineError::InvalidArgument(
                "copy target belongs to a different tenant".into(),
            ));
        }
        tenant.ensure_writable()?;
        self.registry
            .assert_unique_name(&tenant, new_parent, &new_name)
            .await?;
        let copy_token = self
            .registry
            .backend()
            .copy_entry(&tenant, token, new_parent, &new_name)
            .await?;
        self.registry
            .store()
            .resources
            .register(copy_token.clone(), tenant.id)
            .await?;
        Ok(copy_token)
    }

    /// Renames an entry in place, keeping sibling names unique.
    pub async fn rename_entry(
        &self,
        scope: &AccessScope,
        token: &str,
        new_name: &str,
    ) -> EngineResult<()> {
        let new_name = validate_node_name(new_name)?;
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        tenant.ensure_writable()?;
        if let Some(parent) = self.entry_parent(scope, token).await? {
            self.registry
                .assert_unique_name(&tenant, &parent, &new_name)
                .await?;
        }
        self.registry
            .backend()
            .rename_entry(&tenant, token, &new_name)
            .await
    }

    /// Breadth-first case-insensitive name search from a tenant's root.
    pub async fn search(
        &self,
        scope: &AccessScope,
        tenant_id: &muxdrive_core::domain::TenantId,
        keyword: &str,
    ) -> EngineResult<Vec<SearchHit>> {
        let term = keyword.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        self.registry.assert_scope_for_tenant(scope, tenant_id).await?;
        let tenant = self.registry.get_tenant(tenant_id).await?;
        let root = self.registry.list_root_single(&tenant).await?;

        let mut hits = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(root.root_token.clone());
        queue.push_back((root.root_token.clone(), tenant.display_name.clone()));

        while let Some((folder, prefix)) = queue.pop_front() {
            let entries = if folder == root.root_token {
                root.entries.clone()
            } else {
                self.registry.backend().list_folder(&tenant, &folder).await?
            };
            for entry in entries {
                let path = format!("{prefix} / {}", entry.name);
                if entry.name.to_lowercase().contains(&term) {
                    hits.push(SearchHit {
                        entry: entry.clone(),
                        path: path.clone(),
                        tenant_name: tenant.display_name.clone(),
                    });
                }
                if entry.kind.is_folder() && visited.insert(entry.token.clone()) {
                    queue.push_back((entry.token.clone(), path));
                }
            }
        }
        debug!(keyword = %term, hits = hits.len(), "Drive search finished");
        Ok(hits)
    }

    /// Finds an entry's display name by listing its parent (metadata holds
    /// no name); falls back to the token itself if the parent is unknown.
    async fn entry_name(&self, scope: &AccessScope, token: &str) -> EngineResult<String> {
        match self.entry_in_parent(scope, token).await? {
            Some((_, entry)) => Ok(entry.name),
            None => Ok(token.to_string()),
        }
    }

    async fn entry_parent(
        &self,
        scope: &AccessScope,
        token: &str,
    ) -> EngineResult<Option<String>> {
        Ok(self.entry_in_parent(scope, token).await?.map(|(p, _)| p))
    }

    async fn entry_in_parent(
        &self,
        scope: &AccessScope,
        token: &str,
    ) -> EngineResult<Option<(String, RemoteEntry)>> {
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        let listing = self.registry.backend().list_root(&tenant).await?;
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back(listing.root_token.clone());
        visited.insert(listing.root_token);
        while let Some(folder) = queue.pop_front() {
            let entries = self.registry.backend().list_folder(&tenant, &folder).await?;
            for entry in entries {
                if entry.token == token {
                    return Ok(Some((folder, entry)));
                }
                if entry.kind.is_folder() && visited.insert(entry.token.clone()) {
                    queue.push_back(entry.token.clone());
                }
            }
        }
        Ok(None)
    }
}

/// Validates a folder/file name: non-empty, no path separators.
pub fn validate_node_name(raw: &str) -> EngineResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidArgument("name must not be empty".into()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(EngineError::InvalidArgument(
            "name must not contain path separators".into(),
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_node_name_trims() {
        assert_eq!(validate_node_name("  report.pdf ").unwrap(), "report.pdf");
    }

    #[test]
    fn test_validate_node_name_rejects_empty() {
        assert!(validate_node_name("   ").is_err());
    }

    #[test]
    fn test_validate_node_name_rejects_separators() {
        assert!(validate_node_name("a/b").is_err());
        assert!(validate_node_name("a\\b").is_err());
    }
}
