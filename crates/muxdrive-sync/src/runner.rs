//! Sync run execution
//!
//! [`SyncRunner`] owns the full lifecycle of one run: enumerate, plan,
//! execute through the transfer engine, and commit the snapshot. It also
//! implements [`TaskDispatcher`] so the scheduler's ticker can hand it
//! due tasks directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muxdrive_core::checksum::adler32;
use muxdrive_core::domain::{
    SnapshotEntry, SyncDirection, SyncLogEntry, SyncSnapshot, SyncTask, TaskId, TaskStatus,
    Tenant, TransferStatus,
};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::TenantRegistry;
use muxdrive_scheduler::{CronExpr, TaskDispatcher};
use muxdrive_store::Store;
use muxdrive_transfer::TransferEngine;

use crate::diff::{self, SyncAction};
use crate::filter::PathFilter;
use crate::scan::{scan_local, scan_remote, LocalFile, RemoteTree};

/// Executes sync tasks against the transfer engine.
pub struct SyncRunner {
    store: Arc<Store>,
    registry: Arc<TenantRegistry>,
    engine: Arc<TransferEngine>,
    shutdown: CancellationToken,
}

impl SyncRunner {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<TenantRegistry>,
        engine: Arc<TransferEngine>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            engine,
            shutdown,
        })
    }

    /// Manual trigger: marks the task running and executes it inline.
    /// Errors with `Conflict` if a run is already in flight.
    pub async fn trigger(&self, task_id: &TaskId) -> EngineResult<SyncTask> {
        let task = self.store.tasks.get(task_id).await?;
        if task.is_running() {
            return Err(EngineError::Conflict("sync task is already running".into()));
        }
        let marked = self
            .store
            .tasks
            .update(task_id, |t| {
                t.last_status = TaskStatus::Running;
                t.last_run_at = Some(Utc::now());
                t.last_message = Some("sync run started".into());
            })
            .await?;
        self.run_to_completion(marked).await;
        self.store.tasks.get(task_id).await
    }

    /// Runs a task already marked running and records the outcome.
    pub async fn run_to_completion(&self, task: SyncTask) {
        let task_id = task.id;
        let started = std::time::Instant::now();
        let outcome = self.execute(&task).await;
        let next_run = CronExpr::parse(&task.schedule)
            .ok()
            .filter(|_| task.enabled)
            .and_then(|expr| expr.next_occurrence(Utc::now()));

        match outcome {
            Ok(summary) => {
                info!(
                    task_id = %task_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    %summary,
                    "Sync run succeeded"
                );
                self.log(SyncLogEntry::info(task_id, summary.clone())).await;
                let _ = self
                    .store
                    .tasks
                    .update(&task_id, |t| {
                        t.last_status = TaskStatus::Success;
                        t.last_message = Some(summary.clone());
                        t.consecutive_failures = 0;
                        t.next_run_at = next_run;
                    })
                    .await;
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "Sync run failed");
                let message = err.to_string();
                self.log(SyncLogEntry::error(task_id, message.clone())).await;
                let _ = self
                    .store
                    .tasks
                    .update(&task_id, |t| {
                        t.last_status = TaskStatus::Failed;
                        t.last_message = Some(message.clone());
                        t.consecutive_failures += 1;
                        t.next_run_at = next_run;
                    })
                    .await;
            }
        }
    }

    /// One reconciliation pass. On success the snapshot is committed; on
    /// any failure it is left untouched so the next run retries.
    async fn execute(&self, task: &SyncTask) -> EngineResult<String> {
        let tenant = self.store.tenants.get(&task.tenant_id).await?;
        let filter = PathFilter::new(&task.include_globs, &task.exclude_globs)?;
        let local_root = PathBuf::from(&task.local_path);

        if !local_root.exists() {
            match task.direction {
                SyncDirection::LocalToCloud => {
                    return Err(EngineError::LocalIo(format!(
                        "local directory {} does not exist",
                        local_root.display()
                    )));
                }
                _ => {
                    tokio::fs::create_dir_all(&local_root).await?;
                    self.log(SyncLogEntry::info(
                        task.id,
                        format!("created local directory {}", local_root.display()),
                    ))
                    .await;
                }
            }
        }
        if matches!(task.direction, SyncDirection::LocalToCloud) {
            tenant.ensure_writable()?;
        }

        self.log(SyncLogEntry::info(task.id, "scanning local and remote trees"))
            .await;
        let local = scan_local(&local_root, &filter).await?;
        let remote = scan_remote(
            self.registry.backend().as_ref(),
            &tenant,
            &task.remote_folder_token,
            &filter,
        )
        .await?;
        let snapshot = self.store.snapshots.load(&task.id).await?;

        if task.propagate_delete && snapshot.is_empty() {
            self.log(SyncLogEntry::info(
                task.id,
                "first run: baseline snapshot not yet committed, deletions are skipped",
            ))
            .await;
        }

        let checksums = match task.detection {
            muxdrive_core::domain::DetectionMode::Checksum => {
                local_checksums(&local_root, &local).await?
            }
            _ => BTreeMap::new(),
        };

        let plan = diff::plan(
            task.direction,
            task.detection,
            task.conflict,
            task.propagate_delete,
            &remote.files,
            &local,
            &snapshot,
            &checksums,
        );
        for note in &plan.conflicts {
            self.log(SyncLogEntry::warn(task.id, note.clone())).await;
        }

        let counts = plan.summary();
        if plan.is_noop() {
            self.commit_snapshot(task, &tenant, &local_root, &filter)
                .await?;
            return Ok("both sides already in agreement".into());
        }
        self.log(SyncLogEntry::info(
            task.id,
            format!(
                "planned {} downloads, {} uploads, {} remote deletes, {} local deletes",
                counts.downloads, counts.uploads, counts.delete_remote, counts.delete_local
            ),
        ))
        .await;

        let mut dirs = remote.dirs.clone();
        dirs.insert(String::new(), task.remote_folder_token.clone());
        for action in &plan.actions {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.apply(task, &tenant, &local_root, &remote, &mut dirs, action)
                .await?;
        }

        self.commit_snapshot(task, &tenant, &local_root, &filter)
            .await?;
        Ok(format!(
            "{} downloaded, {} uploaded, {} remote deleted, {} local deleted",
            counts.downloads, counts.uploads, counts.delete_remote, counts.delete_local
        ))
    }

    async fn apply(
        &self,
        task: &SyncTask,
        tenant: &Tenant,
        local_root: &Path,
        remote: &RemoteTree,
        dirs: &mut BTreeMap<String, String>,
        action: &SyncAction,
    ) -> EngineResult<()> {
        match action {
            SyncAction::Download(rel) => {
                let file = remote.files.get(rel).ok_or_else(|| {
                    EngineError::NotFound(format!("remote entry vanished: {rel}"))
                })?;
                let target = local_root.join(rel);
                let dest_dir = target
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| local_root.to_path_buf());
                tokio::fs::create_dir_all(&dest_dir).await?;
                let file_name = file_name_of(rel)?;
                self.log(SyncLogEntry::info(task.id, format!("downloading {rel}")))
                    .await;
                let finished = self
                    .engine
                    .sync_download_file(
                        task.id,
                        tenant,
                        &file.token,
                        &dest_dir,
                        &file_name,
                        Some(file.size),
                    )
                    .await?;
                if finished.status != TransferStatus::Success {
                    return Err(EngineError::UpstreamPermanent(format!(
                        "download of {rel} failed: {}",
                        finished.message.unwrap_or_default()
                    )));
                }
                // Align the local mtime with the remote so the committed
                // snapshot matches both sides.
                if let Some(mtime) = file.mtime {
                    set_file_mtime(&target, mtime)?;
                }
                Ok(())
            }
            SyncAction::Upload(rel) => {
                let parent_token = self
                    .ensure_remote_parent(tenant, dirs, rel)
                    .await?;
                let local_file = local_root.join(rel);
                let file_name = file_name_of(rel)?;
                self.log(SyncLogEntry::info(task.id, format!("uploading {rel}")))
                    .await;
                let finished = self
                    .engine
                    .sync_upload_file(task.id, tenant, &parent_token, &local_file, &file_name)
                    .await?;
                if finished.status != TransferStatus::Success {
                    return Err(EngineError::UpstreamPermanent(format!(
                        "upload of {rel} failed: {}",
                        finished.message.unwrap_or_default()
                    )));
                }
                Ok(())
            }
            SyncAction::DeleteRemote(rel) => {
                tenant.ensure_writable()?;
                let file = remote.files.get(rel).ok_or_else(|| {
                    EngineError::NotFound(format!("remote entry vanished: {rel}"))
                })?;
                self.log(SyncLogEntry::info(task.id, format!("deleting remote {rel}")))
                    .await;
                self.registry
                    .backend()
                    .delete_entry(tenant, &file.token, file.kind)
                    .await?;
                self.store.resources.remove(&file.token).await?;
                Ok(())
            }
            SyncAction::DeleteLocal(rel) => {
                let target = local_root.join(rel);
                self.log(SyncLogEntry::info(task.id, format!("deleting local {rel}")))
                    .await;
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            SyncAction::DropSnapshot(_) => Ok(()),
        }
    }

    /// Walks `rel`'s parent directories, creating remote folders that the
    /// enumeration did not already map.
    async fn ensure_remote_parent(
        &self,
        tenant: &Tenant,
        dirs: &mut BTreeMap<String, String>,
        rel: &str,
    ) -> EngineResult<String> {
        let mut current_key = String::new();
        let mut current_token = dirs
            .get("")
            .cloned()
            .ok_or_else(|| EngineError::NotFound("sync root folder token".into()))?;
        let parent = match rel.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => return Ok(current_token),
        };
        for segment in parent.split('/') {
            if !current_key.is_empty() {
                current_key.push('/');
            }
            current_key.push_str(segment);
            if let Some(token) = dirs.get(&current_key) {
                current_token = token.clone();
                continue;
            }
            let token = self
                .registry
                .backend()
                .create_folder(tenant, &current_token, segment)
                .await?;
            self.store
                .resources
                .register(token.clone(), tenant.id)
                .await?;
            dirs.insert(current_key.clone(), token.clone());
            current_token = token;
        }
        Ok(current_token)
    }

    /// Re-enumerates both sides and commits the snapshot: paths from the
    /// local tree, tokens from the remote tree, checksums when the task
    /// detects by content.
    async fn commit_snapshot(
        &self,
        task: &SyncTask,
        tenant: &Tenant,
        local_root: &Path,
        filter: &PathFilter,
    ) -> EngineResult<()> {
        let remote = scan_remote(
            self.registry.backend().as_ref(),
            tenant,
            &task.remote_folder_token,
            filter,
        )
        .await?;

        // Uploads leave the remote with a fresh server-side mtime; pull
        // the local clock into agreement before enumerating.
        let local = scan_local(local_root, filter).await?;
        for (rel, local_file) in &local {
            if let Some(remote_file) = remote.files.get(rel) {
                if remote_file.size == local_file.size {
                    if let (Some(remote_mtime), Some(local_mtime)) =
                        (remote_file.mtime, local_file.mtime)
                    {
                        if (remote_mtime - local_mtime).num_seconds().abs() > 2 {
                            set_file_mtime(&local_root.join(rel), remote_mtime)?;
                        }
                    }
                }
            }
        }

        let local = scan_local(local_root, filter).await?;
        let checksums = match task.detection {
            muxdrive_core::domain::DetectionMode::Checksum => {
                local_checksums(local_root, &local).await?
            }
            _ => BTreeMap::new(),
        };

        let mut entries = BTreeMap::new();
        for (rel, file) in &local {
            entries.insert(
                rel.clone(),
                SnapshotEntry {
                    size: file.size,
                    mtime: file.mtime,
                    remote_token: remote.files.get(rel).map(|r| r.token.clone()),
                    checksum: checksums.get(rel).cloned(),
                },
            );
        }
        let mut snapshot = SyncSnapshot::default();
        snapshot.replace(entries);
        self.store.snapshots.save(&task.id, &snapshot).await
    }

    async fn log(&self, entry: SyncLogEntry) {
        // Sync-log persistence failures never break a run.
        if let Err(err) = self.store.sync_logs.append(entry).await {
            warn!(error = %err, "Failed to append sync log entry");
        }
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for SyncRunner {
    async fn run(&self, task: SyncTask) {
        self.run_to_completion(task).await;
    }
}

fn file_name_of(rel: &str) -> EngineResult<String> {
    rel.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidArgument(format!("bad relative path '{rel}'")))
}

fn set_file_mtime(path: &Path, mtime: chrono::DateTime<Utc>) -> EngineResult<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(std::time::SystemTime::from(mtime))?;
    Ok(())
}

/// Adler-32 of every local file, keyed by relative path.
async fn local_checksums(
    root: &Path,
    files: &BTreeMap<String, LocalFile>,
) -> EngineResult<BTreeMap<String, String>> {
    let mut sums = BTreeMap::new();
    for rel in files.keys() {
        let bytes = tokio::fs::read(root.join(rel)).await?;
        sums.insert(rel.clone(), adler32(&bytes).to_string());
    }
    Ok(sums)
}
