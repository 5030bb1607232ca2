//! Tenant registry and routing decisions

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use muxdrive_core::domain::{
    Group, GroupId, Platform, Tenant, TenantId, TenantPermission,
};
use muxdrive_core::errors::WritableDenial;
use muxdrive_core::ports::{DriveBackend, RemoteEntry, RootListing};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_store::Store;

use crate::scope::{digest_key, AccessScope};

/// Minimum free capacity (ε) a tenant must report to accept writes: 1 MiB.
pub const WRITE_HEADROOM_BYTES: u64 = 1024 * 1024;

/// Concurrent upstream root listings during aggregation.
const ROOT_FANOUT: usize = 5;

/// One tenant's slice of the aggregated root.
#[derive(Debug, Clone)]
pub struct AggregatedRoot {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub root_token: String,
    pub entries: Vec<RemoteEntry>,
}

/// Fields accepted when registering a tenant.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub display_name: String,
    pub app_id: String,
    pub app_secret: String,
    pub platform: Platform,
    pub quota_bytes: u64,
    pub permission: TenantPermission,
}

/// Registry of tenants and groups plus the routing logic over them.
pub struct TenantRegistry {
    store: Arc<Store>,
    backend: Arc<dyn DriveBackend>,
}

impl TenantRegistry {
    pub fn new(store: Arc<Store>, backend: Arc<dyn DriveBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn DriveBackend> {
        &self.backend
    }

    // ------------------------------------------------------------------
    // Scope resolution
    // ------------------------------------------------------------------

    /// Resolves an `X-API-Key` value to its scope.
    pub async fn resolve_scope(&self, api_key: Option<&str>) -> EngineResult<AccessScope> {
        let key = api_key.ok_or(EngineError::AuthMissing)?;
        let config = self.store.config.read().await?;
        if let Some(digest) = &config.security.admin_key_digest {
            if *digest == digest_key(key) {
                return Ok(AccessScope::Admin);
            }
        }
        if let Some(group) = self.store.groups.find_by_api_key(key).await? {
            return Ok(AccessScope::Group(group.id));
        }
        Err(EngineError::AuthInvalid)
    }

    /// Tenants visible to a scope, sorted by routing order.
    pub async fn tenants_for_scope(&self, scope: &AccessScope) -> EngineResult<Vec<Tenant>> {
        let mut tenants = match scope {
            AccessScope::Admin => self.store.tenants.list().await?,
            AccessScope::Group(group_id) => {
                let group = self.store.groups.get(group_id).await?;
                let all = self.store.tenants.list().await?;
                all.into_iter()
                    .filter(|t| group.tenant_ids.contains(&t.id))
                    .collect()
            }
        };
        tenants.sort_by_key(|t| t.order);
        Ok(tenants)
    }

    /// Errors with `ScopeDenied` unless the tenant is in scope.
    pub async fn assert_scope_for_tenant(
        &self,
        scope: &AccessScope,
        tenant_id: &TenantId,
    ) -> EngineResult<()> {
        match scope {
            AccessScope::Admin => Ok(()),
            AccessScope::Group(group_id) => {
                let group = self.store.groups.get(group_id).await?;
                if group.contains(tenant_id) {
                    Ok(())
                } else {
                    Err(EngineError::ScopeDenied(format!(
                        "tenant {tenant_id} is not in group {group_id}"
                    )))
                }
            }
        }
    }

    /// Resolves a token's owning tenant and checks it is in scope.
    pub async fn assert_scope_for_token(
        &self,
        scope: &AccessScope,
        token: &str,
    ) -> EngineResult<TenantId> {
        let tenant_id = self.store.resources.resolve(token).await?;
        self.assert_scope_for_tenant(scope, &tenant_id).await?;
        Ok(tenant_id)
    }

    /// Loads the tenant that owns `token`, scope-checked.
    pub async fn tenant_for_token(
        &self,
        scope: &AccessScope,
        token: &str,
    ) -> EngineResult<Tenant> {
        let tenant_id = self.assert_scope_for_token(scope, token).await?;
        self.store.tenants.get(&tenant_id).await
    }

    // ------------------------------------------------------------------
    // Tenant CRUD
    // ------------------------------------------------------------------

    pub async fn add_tenant(&self, new: NewTenant) -> EngineResult<Tenant> {
        if new.display_name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "tenant display_name must not be empty".into(),
            ));
        }
        let order = self.store.tenants.next_order().await?;
        let mut tenant = Tenant::new(
            new.display_name,
            new.app_id,
            new.app_secret,
            new.platform,
            new.quota_bytes,
            order,
        );
        tenant.permission = new.permission;
        info!(tenant_id = %tenant.id, order, "Registering tenant");
        self.store.tenants.insert(tenant.clone()).await?;
        Ok(tenant)
    }

    pub async fn update_tenant(
        &self,
        id: &TenantId,
        f: impl FnOnce(&mut Tenant),
    ) -> EngineResult<Tenant> {
        self.store.tenants.update(id, f).await
    }

    pub async fn get_tenant(&self, id: &TenantId) -> EngineResult<Tenant> {
        self.store.tenants.get(id).await
    }

    pub async fn list_tenants(&self, scope: &AccessScope) -> EngineResult<Vec<Tenant>> {
        Ok(self
            .tenants_for_scope(scope)
            .await?
            .into_iter()
            .map(|t| t.redacted())
            .collect())
    }

    /// Removes a tenant and scrubs its group memberships and resource
    /// index entries, in the tenants -> groups lock order.
    ///
    /// In-flight transfers bound to the tenant are failed by the caller
    /// (the transfer engine sits above this crate).
    pub async fn remove_tenant(&self, id: &TenantId) -> EngineResult<Tenant> {
        let removed = self.store.tenants.remove(id).await?;
        let scrubbed_groups = self.store.groups.strip_tenant(id).await?;
        let dropped_tokens = self.store.resources.remove_tenant(id).await?;
        info!(
            tenant_id = %id,
            scrubbed_groups,
            dropped_tokens,
            "Tenant removed from registry"
        );
        Ok(removed)
    }

    /// Applies a full reordering. Orders must be unique.
    pub async fn reorder_tenants(&self, orders: &[(TenantId, i32)]) -> EngineResult<()> {
        let mut seen = HashSet::new();
        for (_, order) in orders {
            if !seen.insert(*order) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate order value {order}"
                )));
            }
        }
        self.store.tenants.reorder(orders).await
    }

    /// Refreshes a tenant's quota accounting from the backend. Overruns
    /// are observable, never rejected.
    pub async fn refresh_quota(&self, id: &TenantId) -> EngineResult<Tenant> {
        let tenant = self.store.tenants.get(id).await?;
        let usage = self.backend.quota(&tenant).await?;
        if usage.used_bytes > usage.total_bytes {
            warn!(
                tenant_id = %id,
                used = usage.used_bytes,
                quota = usage.total_bytes,
                "Tenant quota overrun"
            );
        }
        self.store
            .tenants
            .update(id, |t| {
                t.used_bytes = usage.used_bytes;
                if usage.total_bytes > 0 {
                    t.quota_bytes = usage.total_bytes;
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Group CRUD
    // ------------------------------------------------------------------

    pub async fn list_groups(&self) -> EngineResult<Vec<Group>> {
        self.store.groups.list().await
    }

    pub async fn add_group(
        &self,
        name: String,
        remark: Option<String>,
        tenant_ids: Vec<TenantId>,
    ) -> EngineResult<Group> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "group name must not be empty".into(),
            ));
        }
        let sanitized = self.sanitize_membership(tenant_ids).await?;
        let group = Group::new(name, remark, sanitized);
        self.store.groups.insert(group.clone()).await?;
        Ok(group)
    }

    pub async fn update_group(
        &self,
        id: &GroupId,
        name: Option<String>,
        remark: Option<Option<String>>,
        tenant_ids: Option<Vec<TenantId>>,
    ) -> EngineResult<Group> {
        let membership = match tenant_ids {
            Some(ids) => Some(self.sanitize_membership(ids).await?),
            None => None,
        };
        self.store
            .groups
            .update(id, |group| {
                if let Some(name) = name {
                    group.name = name;
                }
                if let Some(remark) = remark {
                    group.remark = remark;
                }
                if let Some(ids) = membership {
                    group.tenant_ids = ids;
                }
            })
            .await
    }

    pub async fn remove_group(&self, id: &GroupId) -> EngineResult<()> {
        self.store.groups.remove(id).await
    }

    pub async fn regenerate_group_key(&self, id: &GroupId) -> EngineResult<Group> {
        self.store
            .groups
            .update(id, |group| group.regenerate_key())
            .await
    }

    /// Drops membership ids that reference no existing tenant, keeping the
    /// no-dangling-references invariant.
    async fn sanitize_membership(
        &self,
        ids: Vec<TenantId>,
    ) -> EngineResult<Vec<TenantId>> {
        let known: HashSet<TenantId> = self
            .store
            .tenants
            .list()
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let mut seen = HashSet::new();
        Ok(ids
            .into_iter()
            .filter(|id| known.contains(id) && seen.insert(*id))
            .collect())
    }

    // ------------------------------------------------------------------
    // Write-target selection
    // ------------------------------------------------------------------

    /// Picks the tenant that will host a write of `required_bytes`.
    ///
    /// Tenants are visited in ascending `order`; inactive and read-only
    /// tenants are skipped; the first with more than
    /// `max(required_bytes, 1 MiB)` free capacity wins.
    pub async fn select_write_target(
        &self,
        scope: &AccessScope,
        required_bytes: u64,
    ) -> EngineResult<Tenant> {
        let tenants = self.tenants_for_scope(scope).await?;
        let mut saw_writable = false;
        let needed = required_bytes.max(WRITE_HEADROOM_BYTES);
        for tenant in tenants {
            if !tenant.active || tenant.is_read_only() {
                continue;
            }
            saw_writable = true;
            if tenant.available_bytes() > needed {
                debug!(
                    tenant_id = %tenant.id,
                    order = tenant.order,
                    available = tenant.available_bytes(),
                    required = required_bytes,
                    "Selected write target"
                );
                return Ok(tenant);
            }
        }
        Err(EngineError::NoWritableTenant {
            reason: if saw_writable {
                WritableDenial::Capacity
            } else {
                WritableDenial::Permission
            },
        })
    }

    /// Resolves the write root (tenant + its root folder token) for a new
    /// write when the caller did not pin a parent folder.
    pub async fn resolve_write_root(
        &self,
        scope: &AccessScope,
        required_bytes: u64,
    ) -> EngineResult<(Tenant, String)> {
        let tenant = self.select_write_target(scope, required_bytes).await?;
        let listing = self.backend.list_root(&tenant).await?;
        self.store
            .resources
            .register(listing.root_token.clone(), tenant.id)
            .await?;
        Ok((tenant, listing.root_token))
    }

    // ------------------------------------------------------------------
    // Root aggregation and listings
    // ------------------------------------------------------------------

    /// Lists one tenant's root, registering observed tokens.
    pub async fn list_root_single(&self, tenant: &Tenant) -> EngineResult<RootListing> {
        let listing = self.backend.list_root(tenant).await?;
        ensure_unique_names(&listing.entries, &listing.root_token)?;
        let mut tokens: Vec<String> =
            listing.entries.iter().map(|e| e.token.clone()).collect();
        tokens.push(listing.root_token.clone());
        self.store.resources.register_many(tokens, tenant.id).await?;
        Ok(listing)
    }

    /// Federated root: every active tenant in scope, listed with bounded
    /// concurrency, returned in registry order.
    pub async fn aggregated_root(
        &self,
        scope: &AccessScope,
    ) -> EngineResult<Vec<AggregatedRoot>> {
        let tenants: Vec<Tenant> = self
            .tenants_for_scope(scope)
            .await?
            .into_iter()
            .filter(|t| t.active)
            .collect();
        if tenants.is_empty() {
            return Err(EngineError::NotFound(
                "no active tenant in scope".into(),
            ));
        }

        let mut by_id: HashMap<TenantId, AggregatedRoot> = HashMap::new();
        for chunk in tenants.chunks(ROOT_FANOUT) {
            let mut set = JoinSet::new();
            for tenant in chunk.iter().cloned() {
                let backend = Arc::clone(&self.backend);
                set.spawn(async move {
                    let listing = backend.list_root(&tenant).await;
                    (tenant, listing)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (tenant, listing) = joined
                    .map_err(|e| EngineError::LocalIo(format!("root listing task: {e}")))?;
                let listing = listing?;
                ensure_unique_names(&listing.entries, &listing.root_token)?;
                let mut tokens: Vec<String> =
                    listing.entries.iter().map(|e| e.token.clone()).collect();
                tokens.push(listing.root_token.clone());
                self.store.resources.register_many(tokens, tenant.id).await?;
                by_id.insert(
                    tenant.id,
                    AggregatedRoot {
                        tenant_id: tenant.id,
                        tenant_name: tenant.display_name.clone(),
                        root_token: listing.root_token,
                        entries: listing.entries,
                    },
                );
            }
        }

        // Union follows the registry's order, not completion order.
        let mut out = Vec::with_capacity(by_id.len());
        for tenant in &tenants {
            if let Some(slice) = by_id.remove(&tenant.id) {
                out.push(slice);
            }
        }
        Ok(out)
    }

    /// Lists a folder in scope, registering child tokens.
    pub async fn list_folder(
        &self,
        scope: &AccessScope,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        let tenant = self.tenant_for_token(scope, folder_token).await?;
        let entries = self.backend.list_folder(&tenant, folder_token).await?;
        ensure_unique_names(&entries, folder_token)?;
        let tokens: Vec<String> = entries.iter().map(|e| e.token.clone()).collect();
        self.store.resources.register_many(tokens, tenant.id).await?;
        Ok(entries)
    }

    /// Errors with `DuplicateName` when `name` is already live under the
    /// parent folder.
    pub async fn assert_unique_name(
        &self,
        tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<()> {
        let entries = self.backend.list_folder(tenant, parent_token).await?;
        ensure_unique_names(&entries, parent_token)?;
        if entries.iter().any(|e| e.name == name) {
            Err(EngineError::DuplicateName(name.to_string()))
        } else {
            Ok(())
        }
    }
}

/// A folder whose listing carries two live entries with one name is
/// undiagnosable; surface it rather than silently picking one.
fn ensure_unique_names(entries: &[RemoteEntry], folder_token: &str) -> EngineResult<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(EngineError::PersistenceCorrupt(format!(
                "folder {folder_token} lists duplicate entry name '{}'",
                entry.name
            )));
        }
    }
    Ok(())
}
