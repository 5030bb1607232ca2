//! Command dispatch
//!
//! Every gateway command is a tagged payload struct validated at the
//! boundary (`deny_unknown_fields` rejects extras) and mapped onto one
//! engine operation. Group-scoped keys may browse and transfer within
//! their scope; everything else requires the admin key.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use muxdrive_audit::{AuditLog, LogQuery};
use muxdrive_core::domain::{
    ApiLogStatus, ConflictPolicy, DetectionMode, GroupId, Platform, SyncDirection, SyncTask,
    TaskId, TaskStatus, TenantId, TenantPermission, TransferId,
};
use muxdrive_core::ports::EntryKind;
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::registry::NewTenant;
use muxdrive_router::{AccessScope, NamespaceService, TenantRegistry};
use muxdrive_scheduler::CronExpr;
use muxdrive_store::Store;
use muxdrive_sync::SyncRunner;
use muxdrive_transfer::TransferEngine;

/// Command names served by the gateway, kept sorted for `list_commands`.
pub const COMMANDS: &[&str] = &[
    "add_group",
    "add_tenant",
    "cancel_transfer",
    "clear_transfers",
    "copy_file",
    "create_folder",
    "create_sync_task",
    "delete_file",
    "delete_group",
    "delete_sync_task",
    "delete_transfer",
    "download_file",
    "download_folder",
    "get_admin_key",
    "get_log_config",
    "get_service_config",
    "get_tenant_detail",
    "list_api_logs",
    "list_commands",
    "list_folder",
    "list_groups",
    "list_root",
    "list_sync_logs",
    "list_sync_tasks",
    "list_tenants",
    "list_transfers",
    "move_file",
    "pause_transfer",
    "refresh_tenant_token",
    "regenerate_group_key",
    "remove_tenant",
    "rename_file",
    "reorder_tenants",
    "restart_transfer",
    "resume_transfer",
    "search",
    "start_service",
    "stop_service",
    "trigger_sync_task",
    "update_group",
    "update_log_config",
    "update_service_config",
    "update_sync_task",
    "update_tenant",
    "upload_file",
    "upload_folder",
];

/// Engine handles shared by every command.
pub struct CommandContext {
    pub store: Arc<Store>,
    pub registry: Arc<TenantRegistry>,
    pub namespace: Arc<NamespaceService>,
    pub engine: Arc<TransferEngine>,
    pub runner: Arc<SyncRunner>,
    pub audit: Arc<AuditLog>,
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddTenantPayload {
    name: String,
    app_id: String,
    app_secret: String,
    #[serde(default)]
    platform: Platform,
    #[serde(default)]
    quota_bytes: u64,
    #[serde(default)]
    permission: TenantPermission,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateTenantPayload {
    tenant_id: TenantId,
    name: Option<String>,
    app_secret: Option<String>,
    quota_bytes: Option<u64>,
    used_bytes: Option<u64>,
    active: Option<bool>,
    platform: Option<Platform>,
    permission: Option<TenantPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TenantIdPayload {
    tenant_id: TenantId,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReorderEntry {
    tenant_id: TenantId,
    order: i32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReorderPayload {
    orders: Vec<ReorderEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddGroupPayload {
    name: String,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    tenant_ids: Vec<TenantId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateGroupPayload {
    group_id: GroupId,
    name: Option<String>,
    /// `null` clears the remark; omitted leaves it unchanged.
    #[serde(default, deserialize_with = "double_option")]
    remark: Option<Option<String>>,
    tenant_ids: Option<Vec<TenantId>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupIdPayload {
    group_id: GroupId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListRootPayload {
    #[serde(default)]
    tenant_id: Option<TenantId>,
    #[serde(default)]
    aggregate: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FolderTokenPayload {
    folder_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchPayload {
    keyword: String,
    #[serde(default)]
    tenant_id: Option<TenantId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateFolderPayload {
    parent_token: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeleteFilePayload {
    token: String,
    #[serde(default)]
    entry_type: Option<EntryKind>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MoveFilePayload {
    token: String,
    new_parent: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyFilePayload {
    token: String,
    new_parent: String,
    new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameFilePayload {
    token: String,
    new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UploadFilePayload {
    local_path: String,
    #[serde(default)]
    parent_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadFilePayload {
    token: String,
    dest_dir: String,
    file_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadFolderPayload {
    folder_token: String,
    dest_dir: String,
    folder_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransferIdPayload {
    transfer_id: TransferId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClearTransfersPayload {
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSyncTaskPayload {
    name: String,
    direction: SyncDirection,
    group_id: GroupId,
    tenant_id: TenantId,
    remote_folder_token: String,
    local_path: String,
    schedule: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    detection: DetectionMode,
    #[serde(default)]
    conflict: ConflictPolicy,
    #[serde(default = "default_true")]
    propagate_delete: bool,
    #[serde(default)]
    include_globs: Vec<String>,
    #[serde(default)]
    exclude_globs: Vec<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateSyncTaskPayload {
    task_id: TaskId,
    name: Option<String>,
    direction: Option<SyncDirection>,
    group_id: Option<GroupId>,
    tenant_id: Option<TenantId>,
    remote_folder_token: Option<String>,
    local_path: Option<String>,
    schedule: Option<String>,
    enabled: Option<bool>,
    detection: Option<DetectionMode>,
    conflict: Option<ConflictPolicy>,
    propagate_delete: Option<bool>,
    include_globs: Option<Vec<String>>,
    exclude_globs: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    notes: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskIdPayload {
    task_id: TaskId,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncLogQueryPayload {
    task_id: TaskId,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApiLogQueryPayload {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    status: Option<ApiLogStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateLogConfigPayload {
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    max_size_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateServiceConfigPayload {
    #[serde(default)]
    listen_host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    autostart: Option<bool>,
}

fn default_true() -> bool {
    true
}

/// Distinguishes an omitted field from an explicit `null`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

fn parse<T: DeserializeOwned>(payload: &Option<Value>) -> EngineResult<T> {
    let value = payload
        .clone()
        .ok_or_else(|| EngineError::InvalidArgument("missing payload".into()))?;
    serde_json::from_value(value).map_err(|e| EngineError::InvalidArgument(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(payload: &Option<Value>) -> EngineResult<T> {
    match payload {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| EngineError::InvalidArgument(e.to_string())),
        None => Ok(T::default()),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))
}

impl CommandContext {
    /// Dispatches one command within a resolved scope.
    pub async fn dispatch(
        &self,
        scope: &AccessScope,
        command: &str,
        payload: Option<Value>,
    ) -> EngineResult<Value> {
        match command {
            // -- Tenants ---------------------------------------------------
            "list_tenants" => to_value(self.registry.list_tenants(scope).await?),
            "add_tenant" => {
                scope.ensure_admin()?;
                let data: AddTenantPayload = parse(&payload)?;
                let tenant = self
                    .registry
                    .add_tenant(NewTenant {
                        display_name: data.name,
                        app_id: data.app_id,
                        app_secret: data.app_secret,
                        platform: data.platform,
                        quota_bytes: data.quota_bytes,
                        permission: data.permission,
                    })
                    .await?;
                to_value(tenant.redacted())
            }
            "update_tenant" => {
                scope.ensure_admin()?;
                let data: UpdateTenantPayload = parse(&payload)?;
                let tenant = self
                    .registry
                    .update_tenant(&data.tenant_id, |t| {
                        if let Some(name) = data.name {
                            t.display_name = name;
                        }
                        if let Some(secret) = data.app_secret {
                            t.app_secret = secret;
                        }
                        if let Some(quota) = data.quota_bytes {
                            t.quota_bytes = quota;
                        }
                        if let Some(used) = data.used_bytes {
                            t.used_bytes = used;
                        }
                        if let Some(active) = data.active {
                            t.active = active;
                        }
                        if let Some(platform) = data.platform {
                            t.platform = platform;
                        }
                        if let Some(permission) = data.permission {
                            t.permission = permission;
                        }
                    })
                    .await?;
                to_value(tenant.redacted())
            }
            "get_tenant_detail" => {
                scope.ensure_admin()?;
                let data: TenantIdPayload = parse(&payload)?;
                to_value(self.registry.get_tenant(&data.tenant_id).await?)
            }
            "remove_tenant" => {
                scope.ensure_admin()?;
                let data: TenantIdPayload = parse(&payload)?;
                let removed = self.registry.remove_tenant(&data.tenant_id).await?;
                let failed = self.engine.fail_tenant_transfers(&removed.id).await?;
                Ok(json!({ "removed": removed.id, "transfers_failed": failed }))
            }
            "reorder_tenants" => {
                scope.ensure_admin()?;
                let data: ReorderPayload = parse(&payload)?;
                let orders: Vec<(TenantId, i32)> = data
                    .orders
                    .into_iter()
                    .map(|e| (e.tenant_id, e.order))
                    .collect();
                self.registry.reorder_tenants(&orders).await?;
                Ok(Value::Null)
            }
            "refresh_tenant_token" => {
                scope.ensure_admin()?;
                let data: TenantIdPayload = parse(&payload)?;
                let tenant = self.registry.refresh_quota(&data.tenant_id).await?;
                to_value(tenant.redacted())
            }

            // -- Groups ----------------------------------------------------
            "list_groups" => {
                scope.ensure_admin()?;
                to_value(self.registry.list_groups().await?)
            }
            "add_group" => {
                scope.ensure_admin()?;
                let data: AddGroupPayload = parse(&payload)?;
                to_value(
                    self.registry
                        .add_group(data.name, data.remark, data.tenant_ids)
                        .await?,
                )
            }
            "update_group" => {
                scope.ensure_admin()?;
                let data: UpdateGroupPayload = parse(&payload)?;
                to_value(
                    self.registry
                        .update_group(&data.group_id, data.name, data.remark, data.tenant_ids)
                        .await?,
                )
            }
            "delete_group" => {
                scope.ensure_admin()?;
                let data: GroupIdPayload = parse(&payload)?;
                self.registry.remove_group(&data.group_id).await?;
                Ok(Value::Null)
            }
            "regenerate_group_key" => {
                scope.ensure_admin()?;
                let data: GroupIdPayload = parse(&payload)?;
                to_value(self.registry.regenerate_group_key(&data.group_id).await?)
            }

            // -- Browsing --------------------------------------------------
            "list_root" => {
                let data: ListRootPayload = parse_or_default(&payload)?;
                if data.aggregate.unwrap_or(false) {
                    let roots = self.registry.aggregated_root(scope).await?;
                    let tenants: Vec<Value> = roots
                        .into_iter()
                        .map(|r| {
                            json!({
                                "tenant_id": r.tenant_id,
                                "tenant_name": r.tenant_name,
                                "root_token": r.root_token,
                                "entries": r.entries,
                            })
                        })
                        .collect();
                    return Ok(json!({ "aggregate": true, "tenants": tenants }));
                }
                let tenant = match data.tenant_id {
                    Some(id) => {
                        self.registry.assert_scope_for_tenant(scope, &id).await?;
                        self.registry.get_tenant(&id).await?
                    }
                    None => self.first_active_tenant(scope).await?,
                };
                let listing = self.registry.list_root_single(&tenant).await?;
                Ok(json!({
                    "tenant_id": tenant.id,
                    "root_token": listing.root_token,
                    "entries": listing.entries,
                }))
            }
            "list_folder" => {
                let data: FolderTokenPayload = parse(&payload)?;
                to_value(self.registry.list_folder(scope, &data.folder_token).await?)
            }
            "search" => {
                let data: SearchPayload = parse(&payload)?;
                let tenant_id = match data.tenant_id {
                    Some(id) => id,
                    None => self.first_active_tenant(scope).await?.id,
                };
                let hits = self
                    .namespace
                    .search(scope, &tenant_id, &data.keyword)
                    .await?;
                let rendered: Vec<Value> = hits
                    .into_iter()
                    .map(|h| {
                        json!({
                            "entry": h.entry,
                            "path": h.path,
                            "tenant_name": h.tenant_name,
                        })
                    })
                    .collect();
                Ok(Value::Array(rendered))
            }

            // -- Namespace writes -----------------------------------------
            "create_folder" => {
                let data: CreateFolderPayload = parse(&payload)?;
                let token = self
                    .namespace
                    .create_folder(scope, &data.parent_token, &data.name)
                    .await?;
                Ok(json!({ "token": token }))
            }
            "delete_file" => {
                let data: DeleteFilePayload = parse(&payload)?;
                self.namespace
                    .delete_entry(scope, &data.token, data.entry_type.unwrap_or(EntryKind::File))
                    .await?;
                Ok(Value::Null)
            }
            "move_file" => {
                let data: MoveFilePayload = parse(&payload)?;
                self.namespace
                    .move_entry(scope, &data.token, &data.new_parent)
                    .await?;
                Ok(Value::Null)
            }
            "copy_file" => {
                let data: CopyFilePayload = parse(&payload)?;
                let token = self
                    .namespace
                    .copy_entry(scope, &data.token, &data.new_parent, &data.new_name)
                    .await?;
                Ok(json!({ "token": token }))
            }
            "rename_file" => {
                let data: RenameFilePayload = parse(&payload)?;
                self.namespace
                    .rename_entry(scope, &data.token, &data.new_name)
                    .await?;
                Ok(Value::Null)
            }

            // -- Transfers -------------------------------------------------
            "upload_file" => {
                let data: UploadFilePayload = parse(&payload)?;
                to_value(
                    self.engine
                        .enqueue_file_upload(
                            scope,
                            &PathBuf::from(data.local_path),
                            data.parent_token,
                        )
                        .await?,
                )
            }
            "upload_folder" => {
                let data: UploadFilePayload = parse(&payload)?;
                to_value(
                    self.engine
                        .enqueue_folder_upload(
                            scope,
                            &PathBuf::from(data.local_path),
                            data.parent_token,
                        )
                        .await?,
                )
            }
            "download_file" => {
                let data: DownloadFilePayload = parse(&payload)?;
                to_value(
                    self.engine
                        .enqueue_file_download(
                            scope,
                            &data.token,
                            &PathBuf::from(data.dest_dir),
                            &data.file_name,
                        )
                        .await?,
                )
            }
            "download_folder" => {
                let data: DownloadFolderPayload = parse(&payload)?;
                to_value(
                    self.engine
                        .enqueue_folder_download(
                            scope,
                            &data.folder_token,
                            &PathBuf::from(data.dest_dir),
                            &data.folder_name,
                        )
                        .await?,
                )
            }
            "list_transfers" => {
                scope.ensure_admin()?;
                to_value(self.engine.list().await?)
            }
            "pause_transfer" => {
                scope.ensure_admin()?;
                let data: TransferIdPayload = parse(&payload)?;
                to_value(self.engine.pause(&data.transfer_id).await?)
            }
            "resume_transfer" => {
                scope.ensure_admin()?;
                let data: TransferIdPayload = parse(&payload)?;
                to_value(self.engine.resume(&data.transfer_id).await?)
            }
            "cancel_transfer" => {
                scope.ensure_admin()?;
                let data: TransferIdPayload = parse(&payload)?;
                to_value(self.engine.cancel(&data.transfer_id).await?)
            }
            "restart_transfer" => {
                scope.ensure_admin()?;
                let data: TransferIdPayload = parse(&payload)?;
                to_value(self.engine.restart(&data.transfer_id).await?)
            }
            "delete_transfer" => {
                scope.ensure_admin()?;
                let data: TransferIdPayload = parse(&payload)?;
                self.engine.delete(&data.transfer_id).await?;
                Ok(Value::Null)
            }
            "clear_transfers" => {
                scope.ensure_admin()?;
                let data: ClearTransfersPayload = parse_or_default(&payload)?;
                let removed = self
                    .engine
                    .clear(data.mode.as_deref().unwrap_or("finished"))
                    .await?;
                Ok(json!({ "removed": removed }))
            }

            // -- Sync tasks ------------------------------------------------
            "list_sync_tasks" => {
                scope.ensure_admin()?;
                to_value(self.store.tasks.list().await?)
            }
            "create_sync_task" => {
                scope.ensure_admin()?;
                let data: CreateSyncTaskPayload = parse(&payload)?;
                to_value(self.create_sync_task(data).await?)
            }
            "update_sync_task" => {
                scope.ensure_admin()?;
                let data: UpdateSyncTaskPayload = parse(&payload)?;
                to_value(self.update_sync_task(data).await?)
            }
            "delete_sync_task" => {
                scope.ensure_admin()?;
                let data: TaskIdPayload = parse(&payload)?;
                let task = self.store.tasks.get(&data.task_id).await?;
                if task.is_running() {
                    return Err(EngineError::Conflict(
                        "sync task is running; wait for completion".into(),
                    ));
                }
                self.store.tasks.remove(&data.task_id).await?;
                self.store.snapshots.delete(&data.task_id).await?;
                Ok(Value::Null)
            }
            "trigger_sync_task" => {
                scope.ensure_admin()?;
                let data: TaskIdPayload = parse(&payload)?;
                to_value(self.runner.trigger(&data.task_id).await?)
            }
            "list_sync_logs" => {
                scope.ensure_admin()?;
                let data: SyncLogQueryPayload = parse(&payload)?;
                let limit = data.limit.unwrap_or(100).min(500);
                to_value(
                    self.store
                        .sync_logs
                        .list_for_task(&data.task_id, limit)
                        .await?,
                )
            }

            // -- Logs and keys ---------------------------------------------
            "list_api_logs" => {
                scope.ensure_admin()?;
                let data: ApiLogQueryPayload = parse_or_default(&payload)?;
                let query = LogQuery {
                    command_contains: data.command,
                    status: data.status,
                    limit: data.limit.unwrap_or(100).min(1000),
                };
                to_value(self.audit.query(&query).await?)
            }
            "get_log_config" => {
                scope.ensure_admin()?;
                to_value(self.store.config.read().await?.logging)
            }
            "update_log_config" => {
                scope.ensure_admin()?;
                let data: UpdateLogConfigPayload = parse(&payload)?;
                let updated = self
                    .store
                    .config
                    .update(|cfg| {
                        if let Some(dir) = data.directory {
                            cfg.logging.directory = Some(dir);
                        }
                        if let Some(cap) = data.max_size_mb {
                            cfg.logging.max_size_mb = cap;
                        }
                        cfg.logging.clone()
                    })
                    .await?;
                self.audit.set_max_size_mb(updated.clamped_max_mb());
                to_value(updated)
            }
            "get_admin_key" => {
                scope.ensure_admin()?;
                let config = self.store.config.read().await?;
                Ok(json!({ "api_key": config.security.admin_key_plain }))
            }
            "list_commands" => {
                scope.ensure_admin()?;
                to_value(COMMANDS)
            }
            "update_service_config" => {
                scope.ensure_admin()?;
                let data: UpdateServiceConfigPayload = parse(&payload)?;
                let updated = self
                    .store
                    .config
                    .update(|cfg| {
                        if let Some(host) = data.listen_host {
                            cfg.service.listen_host = host;
                        }
                        if let Some(port) = data.port {
                            cfg.service.port = port;
                        }
                        if let Some(timeout) = data.timeout_secs {
                            cfg.service.timeout_secs = timeout;
                        }
                        if let Some(autostart) = data.autostart {
                            cfg.service.autostart = autostart;
                        }
                        cfg.service.clone()
                    })
                    .await?;
                to_value(updated)
            }
            "get_service_config" => {
                scope.ensure_admin()?;
                to_value(self.store.config.read().await?.service)
            }

            // `start_service` / `stop_service` are handled by the server
            // layer, which owns the listener.
            _ => Err(EngineError::NotFound(format!("unknown command {command}"))),
        }
    }

    async fn first_active_tenant(&self, scope: &AccessScope) -> EngineResult<muxdrive_core::domain::Tenant> {
        self.registry
            .tenants_for_scope(scope)
            .await?
            .into_iter()
            .find(|t| t.active)
            .ok_or_else(|| EngineError::NotFound("no active tenant in scope".into()))
    }

    async fn create_sync_task(&self, data: CreateSyncTaskPayload) -> EngineResult<SyncTask> {
        let expr = CronExpr::parse(&data.schedule)?;
        let group = self.store.groups.get(&data.group_id).await?;
        if !group.contains(&data.tenant_id) {
            return Err(EngineError::InvalidArgument(format!(
                "tenant {} is not a member of group {}",
                data.tenant_id, data.group_id
            )));
        }
        self.store.tenants.get(&data.tenant_id).await?;

        let now = chrono::Utc::now();
        let next_run = data.enabled.then(|| expr.next_occurrence(now)).flatten();
        let task = SyncTask {
            id: TaskId::new(),
            name: data.name,
            direction: data.direction,
            group_id: data.group_id,
            tenant_id: data.tenant_id,
            remote_folder_token: data.remote_folder_token,
            local_path: data.local_path,
            schedule: expr.to_string(),
            enabled: data.enabled,
            detection: data.detection,
            conflict: data.conflict,
            propagate_delete: data.propagate_delete,
            include_globs: data.include_globs,
            exclude_globs: data.exclude_globs,
            notes: data.notes,
            created_at: now,
            updated_at: now,
            next_run_at: next_run,
            last_run_at: None,
            last_status: if data.enabled {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Idle
            },
            last_message: None,
            consecutive_failures: 0,
        };
        self.store.tasks.insert(task.clone()).await?;
        Ok(task)
    }

    async fn update_sync_task(&self, data: UpdateSyncTaskPayload) -> EngineResult<SyncTask> {
        let task_id = data.task_id;
        let current = self.store.tasks.get(&task_id).await?;
        if current.is_running() {
            return Err(EngineError::Conflict(
                "sync task is running; wait for completion".into(),
            ));
        }

        // Validate the new schedule outside the store lock.
        let normalized_schedule = match &data.schedule {
            Some(schedule) => Some(CronExpr::parse(schedule)?.to_string()),
            None => None,
        };
        if let Some(group_id) = &data.group_id {
            self.store.groups.get(group_id).await?;
        }
        if let Some(tenant_id) = &data.tenant_id {
            self.store.tenants.get(tenant_id).await?;
        }

        // Retargeting invalidates the baseline snapshot.
        let retargeted = data
            .direction
            .map(|d| d != current.direction)
            .unwrap_or(false)
            || data
                .remote_folder_token
                .as_ref()
                .map(|t| *t != current.remote_folder_token)
                .unwrap_or(false)
            || data
                .local_path
                .as_ref()
                .map(|p| *p != current.local_path)
                .unwrap_or(false);

        let updated = self
            .store
            .tasks
            .update(&task_id, |t| {
                if let Some(name) = data.name {
                    t.name = name;
                }
                if let Some(direction) = data.direction {
                    t.direction = direction;
                }
                if let Some(group_id) = data.group_id {
                    t.group_id = group_id;
                }
                if let Some(tenant_id) = data.tenant_id {
                    t.tenant_id = tenant_id;
                }
                if let Some(token) = data.remote_folder_token {
                    t.remote_folder_token = token;
                }
                if let Some(path) = data.local_path {
                    t.local_path = path;
                }
                if let Some(schedule) = normalized_schedule {
                    t.schedule = schedule;
                }
                if let Some(enabled) = data.enabled {
                    t.enabled = enabled;
                }
                if let Some(detection) = data.detection {
                    t.detection = detection;
                }
                if let Some(conflict) = data.conflict {
                    t.conflict = conflict;
                }
                if let Some(propagate) = data.propagate_delete {
                    t.propagate_delete = propagate;
                }
                if let Some(includes) = data.include_globs {
                    t.include_globs = includes;
                }
                if let Some(excludes) = data.exclude_globs {
                    t.exclude_globs = excludes;
                }
                if let Some(notes) = data.notes {
                    t.notes = notes;
                }
                if retargeted {
                    t.last_status = TaskStatus::Idle;
                    t.last_message = Some("task retargeted; next run rebuilds baseline".into());
                    t.last_run_at = None;
                    t.consecutive_failures = 0;
                }
                // next_run_at is recomputed on every update.
                t.next_run_at = if t.enabled {
                    CronExpr::parse(&t.schedule)
                        .ok()
                        .and_then(|expr| expr.next_occurrence(chrono::Utc::now()))
                } else {
                    None
                };
            })
            .await?;

        if retargeted {
            self.store.snapshots.delete(&task_id).await?;
        }
        Ok(updated)
    }
}
