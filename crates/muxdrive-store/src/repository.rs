//! Typed repositories over the document store
//!
//! [`Store`] bundles one [`JsonDocument`] per persisted file and exposes
//! the focused accessors each subsystem needs. The wrappers keep the file
//! formats (`*StoreFile` with a version tag) private to this crate.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use muxdrive_core::config::EngineConfig;
use muxdrive_core::domain::{
    Group, GroupId, SyncLogEntry, SyncTask, TaskId, Tenant, TenantId, Transfer, TransferId,
};
use muxdrive_core::{EngineError, EngineResult};

use crate::document::JsonDocument;
use crate::snapshots::SnapshotStore;

pub const TENANTS_FILE: &str = "tenants.json";
pub const GROUPS_FILE: &str = "groups.json";
pub const TASKS_FILE: &str = "tasks.json";
pub const TRANSFERS_FILE: &str = "transfers.json";
pub const SYNC_LOGS_FILE: &str = "sync_logs.json";
pub const RESOURCE_INDEX_FILE: &str = "resource_index.json";
pub const CONFIG_FILE: &str = "config.json";

/// Sync log lines retained in the document.
const SYNC_LOG_RETENTION: usize = 2000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TenantStoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupStoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskStoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tasks: Vec<SyncTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TransferStoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tasks: Vec<Transfer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncLogStoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    logs: Vec<SyncLogEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ResourceIndexFile {
    #[serde(default)]
    version: u32,
    /// token -> owning tenant id.
    #[serde(default)]
    resources: BTreeMap<String, TenantId>,
}

/// All persistent documents of one engine instance.
pub struct Store {
    pub config: ConfigRepo,
    pub tenants: TenantRepo,
    pub groups: GroupRepo,
    pub tasks: TaskRepo,
    pub snapshots: SnapshotStore,
    pub transfers: TransferRepo,
    pub sync_logs: SyncLogRepo,
    pub resources: ResourceIndexRepo,
}

impl Store {
    /// Opens every document under `data_dir`, creating the directory if
    /// needed. Individual corrupt files are quarantined, not fatal.
    pub async fn open(data_dir: &Path) -> EngineResult<Arc<Self>> {
        tokio::fs::create_dir_all(data_dir).await?;
        Ok(Arc::new(Self {
            config: ConfigRepo {
                doc: JsonDocument::open(data_dir.join(CONFIG_FILE)).await?,
            },
            tenants: TenantRepo {
                doc: JsonDocument::open(data_dir.join(TENANTS_FILE)).await?,
            },
            groups: GroupRepo {
                doc: JsonDocument::open(data_dir.join(GROUPS_FILE)).await?,
            },
            tasks: TaskRepo {
                doc: JsonDocument::open(data_dir.join(TASKS_FILE)).await?,
            },
            snapshots: SnapshotStore::new(data_dir.join("snapshots")),
            transfers: TransferRepo {
                doc: JsonDocument::open(data_dir.join(TRANSFERS_FILE)).await?,
            },
            sync_logs: SyncLogRepo {
                doc: JsonDocument::open(data_dir.join(SYNC_LOGS_FILE)).await?,
            },
            resources: ResourceIndexRepo {
                doc: JsonDocument::open(data_dir.join(RESOURCE_INDEX_FILE)).await?,
            },
        }))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

pub struct ConfigRepo {
    doc: JsonDocument<EngineConfig>,
}

impl ConfigRepo {
    pub async fn read(&self) -> EngineResult<EngineConfig> {
        self.doc.read().await
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut EngineConfig) -> R) -> EngineResult<R> {
        self.doc.update(f).await
    }
}

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

pub struct TenantRepo {
    doc: JsonDocument<TenantStoreFile>,
}

impl TenantRepo {
    pub async fn list(&self) -> EngineResult<Vec<Tenant>> {
        self.doc.with(|f| f.tenants.clone()).await
    }

    pub async fn get(&self, id: &TenantId) -> EngineResult<Tenant> {
        self.doc
            .with(|f| f.tenants.iter().find(|t| t.id == *id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))
    }

    /// Next free routing order (max + 1).
    pub async fn next_order(&self) -> EngineResult<i32> {
        self.doc
            .with(|f| f.tenants.iter().map(|t| t.order).max().unwrap_or(0) + 1)
            .await
    }

    pub async fn insert(&self, tenant: Tenant) -> EngineResult<()> {
        self.doc.update(|f| f.tenants.push(tenant)).await
    }

    /// Applies `f` to the tenant and returns the updated record.
    pub async fn update(
        &self,
        id: &TenantId,
        f: impl FnOnce(&mut Tenant),
    ) -> EngineResult<Tenant> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let tenant = file
                    .tenants
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))?;
                f(tenant);
                Ok(tenant.clone())
            })
            .await
    }

    /// Removes the tenant, returning the removed record.
    pub async fn remove(&self, id: &TenantId) -> EngineResult<Tenant> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let pos = file
                    .tenants
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))?;
                Ok(file.tenants.remove(pos))
            })
            .await
    }

    /// Replaces every tenant's order in one write.
    pub async fn reorder(&self, orders: &[(TenantId, i32)]) -> EngineResult<()> {
        let orders = orders.to_vec();
        self.doc
            .try_update(|file| {
                for (id, order) in &orders {
                    let tenant = file
                        .tenants
                        .iter_mut()
                        .find(|t| t.id == *id)
                        .ok_or_else(|| EngineError::NotFound(format!("tenant {id}")))?;
                    tenant.order = *order;
                }
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

pub struct GroupRepo {
    doc: JsonDocument<GroupStoreFile>,
}

impl GroupRepo {
    pub async fn list(&self) -> EngineResult<Vec<Group>> {
        self.doc.with(|f| f.groups.clone()).await
    }

    pub async fn get(&self, id: &GroupId) -> EngineResult<Group> {
        self.doc
            .with(|f| f.groups.iter().find(|g| g.id == *id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("group {id}")))
    }

    pub async fn find_by_api_key(&self, key: &str) -> EngineResult<Option<Group>> {
        let key = key.to_string();
        self.doc
            .with(move |f| f.groups.iter().find(|g| g.api_key == key).cloned())
            .await
    }

    pub async fn insert(&self, group: Group) -> EngineResult<()> {
        self.doc.update(|f| f.groups.push(group)).await
    }

    pub async fn update(
        &self,
        id: &GroupId,
        f: impl FnOnce(&mut Group),
    ) -> EngineResult<Group> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let group = file
                    .groups
                    .iter_mut()
                    .find(|g| g.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
                f(group);
                Ok(group.clone())
            })
            .await
    }

    pub async fn remove(&self, id: &GroupId) -> EngineResult<()> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let pos = file
                    .groups
                    .iter()
                    .position(|g| g.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
                file.groups.remove(pos);
                Ok(())
            })
            .await
    }

    /// Removes `tenant_id` from every group's membership in one write.
    pub async fn strip_tenant(&self, tenant_id: &TenantId) -> EngineResult<usize> {
        let tenant_id = *tenant_id;
        self.doc
            .update(move |file| {
                let mut touched = 0;
                for group in &mut file.groups {
                    let before = group.tenant_ids.len();
                    group.tenant_ids.retain(|id| *id != tenant_id);
                    if group.tenant_ids.len() != before {
                        touched += 1;
                    }
                }
                touched
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Sync tasks
// ---------------------------------------------------------------------------

pub struct TaskRepo {
    doc: JsonDocument<TaskStoreFile>,
}

impl TaskRepo {
    pub async fn list(&self) -> EngineResult<Vec<SyncTask>> {
        self.doc.with(|f| f.tasks.clone()).await
    }

    pub async fn get(&self, id: &TaskId) -> EngineResult<SyncTask> {
        self.doc
            .with(|f| f.tasks.iter().find(|t| t.id == *id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("sync task {id}")))
    }

    pub async fn insert(&self, task: SyncTask) -> EngineResult<()> {
        self.doc.update(|f| f.tasks.push(task)).await
    }

    pub async fn update(
        &self,
        id: &TaskId,
        f: impl FnOnce(&mut SyncTask),
    ) -> EngineResult<SyncTask> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let task = file
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("sync task {id}")))?;
                f(task);
                task.updated_at = chrono::Utc::now();
                Ok(task.clone())
            })
            .await
    }

    pub async fn remove(&self, id: &TaskId) -> EngineResult<()> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let pos = file
                    .tasks
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("sync task {id}")))?;
                file.tasks.remove(pos);
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

pub struct TransferRepo {
    doc: JsonDocument<TransferStoreFile>,
}

impl TransferRepo {
    pub async fn list(&self) -> EngineResult<Vec<Transfer>> {
        self.doc.with(|f| f.tasks.clone()).await
    }

    pub async fn get(&self, id: &TransferId) -> EngineResult<Transfer> {
        self.doc
            .with(|f| f.tasks.iter().find(|t| t.id == *id).cloned())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("transfer {id}")))
    }

    pub async fn insert(&self, transfer: Transfer) -> EngineResult<()> {
        self.doc.update(|f| f.tasks.push(transfer)).await
    }

    pub async fn update(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut Transfer),
    ) -> EngineResult<Transfer> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let transfer = file
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("transfer {id}")))?;
                f(transfer);
                transfer.updated_at = chrono::Utc::now();
                Ok(transfer.clone())
            })
            .await
    }

    /// Applies `f` to every record matching `pred`; returns the updated
    /// records.
    pub async fn update_matching(
        &self,
        pred: impl Fn(&Transfer) -> bool,
        f: impl Fn(&mut Transfer),
    ) -> EngineResult<Vec<Transfer>> {
        self.doc
            .update(move |file| {
                let mut updated = Vec::new();
                for transfer in file.tasks.iter_mut().filter(|t| pred(t)) {
                    f(transfer);
                    transfer.updated_at = chrono::Utc::now();
                    updated.push(transfer.clone());
                }
                updated
            })
            .await
    }

    pub async fn remove(&self, id: &TransferId) -> EngineResult<()> {
        let id = *id;
        self.doc
            .try_update(|file| {
                let pos = file
                    .tasks
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("transfer {id}")))?;
                file.tasks.remove(pos);
                Ok(())
            })
            .await
    }

    /// Removes every record matching `pred`; returns how many were removed.
    pub async fn remove_matching(
        &self,
        pred: impl Fn(&Transfer) -> bool,
    ) -> EngineResult<usize> {
        self.doc
            .update(move |file| {
                let before = file.tasks.len();
                file.tasks.retain(|t| !pred(t));
                before - file.tasks.len()
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Sync logs
// ---------------------------------------------------------------------------

pub struct SyncLogRepo {
    doc: JsonDocument<SyncLogStoreFile>,
}

impl SyncLogRepo {
    /// Appends a line, dropping the oldest beyond the retention cap.
    pub async fn append(&self, entry: SyncLogEntry) -> EngineResult<()> {
        self.doc
            .update(move |file| {
                file.logs.push(entry);
                if file.logs.len() > SYNC_LOG_RETENTION {
                    let excess = file.logs.len() - SYNC_LOG_RETENTION;
                    file.logs.drain(0..excess);
                }
            })
            .await
    }

    /// Most recent `limit` lines for one task, newest last.
    pub async fn list_for_task(
        &self,
        task_id: &TaskId,
        limit: usize,
    ) -> EngineResult<Vec<SyncLogEntry>> {
        let task_id = *task_id;
        self.doc
            .with(move |file| {
                let matching: Vec<_> = file
                    .logs
                    .iter()
                    .filter(|l| l.task_id == task_id)
                    .cloned()
                    .collect();
                let skip = matching.len().saturating_sub(limit);
                matching.into_iter().skip(skip).collect()
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Resource index (token -> tenant)
// ---------------------------------------------------------------------------

pub struct ResourceIndexRepo {
    doc: JsonDocument<ResourceIndexFile>,
}

impl ResourceIndexRepo {
    pub async fn register(&self, token: impl Into<String>, tenant: TenantId) -> EngineResult<()> {
        let token = token.into();
        self.doc
            .update(move |file| {
                file.resources.insert(token, tenant);
            })
            .await
    }

    pub async fn register_many(
        &self,
        tokens: impl IntoIterator<Item = String>,
        tenant: TenantId,
    ) -> EngineResult<()> {
        let tokens: Vec<String> = tokens.into_iter().collect();
        self.doc
            .update(move |file| {
                for token in tokens {
                    file.resources.insert(token, tenant);
                }
            })
            .await
    }

    pub async fn remove(&self, token: &str) -> EngineResult<()> {
        let token = token.to_string();
        self.doc
            .update(move |file| {
                file.resources.remove(&token);
            })
            .await
    }

    /// Drops every token owned by `tenant`; returns how many were removed.
    pub async fn remove_tenant(&self, tenant: &TenantId) -> EngineResult<usize> {
        let tenant = *tenant;
        self.doc
            .update(move |file| {
                let before = file.resources.len();
                file.resources.retain(|_, owner| *owner != tenant);
                before - file.resources.len()
            })
            .await
    }

    /// Resolves the owning tenant for `token`.
    pub async fn resolve(&self, token: &str) -> EngineResult<TenantId> {
        let token_owned = token.to_string();
        self.doc
            .with(move |file| file.resources.get(&token_owned).copied())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no tenant known for token {token}")))
    }
}
