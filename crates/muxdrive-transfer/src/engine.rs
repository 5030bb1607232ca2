//! Transfer engine
//!
//! A single-process engine with bounded per-direction worker pools and a
//! per-tenant parallelism cap. Transfers are durable records; the queue is
//! reconstructed from disk on startup (`running`/`pending` demote to
//! `paused` so the user explicitly resumes). Workers never hold a lock
//! across a network call: every persisted step goes record -> disk ->
//! event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muxdrive_core::config::TransferConfig;
use muxdrive_core::domain::{
    ResumePayload, TaskId, Tenant, TenantId, Transfer, TransferId, TransferKind, TransferStatus,
};
use muxdrive_core::ports::{DriveBackend, EntryKind};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::{AccessScope, TenantRegistry};
use muxdrive_store::Store;

use crate::control::{ControlGate, TransferControl};
use crate::events::{EventBus, TransferEvent};
use crate::retry::{with_retry, RetryPolicy};

/// Outcome of one worker pass over a transfer.
enum Outcome {
    Completed,
    /// The worker yielded at a block boundary; the record stays paused.
    Paused,
}

/// The durable upload/download pipeline.
pub struct TransferEngine {
    store: Arc<Store>,
    registry: Arc<TenantRegistry>,
    config: TransferConfig,
    bus: EventBus,
    controls: DashMap<TransferId, Arc<TransferControl>>,
    queue_tx: mpsc::UnboundedSender<TransferId>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferId>>>,
    upload_slots: Arc<Semaphore>,
    download_slots: Arc<Semaphore>,
    tenant_slots: DashMap<TenantId, Arc<Semaphore>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<TenantRegistry>,
        config: TransferConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            registry,
            upload_slots: Arc::new(Semaphore::new(config.workers_per_direction.max(1))),
            download_slots: Arc::new(Semaphore::new(config.workers_per_direction.max(1))),
            config,
            bus: EventBus::new(),
            controls: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            tenant_slots: DashMap::new(),
        })
    }

    fn backend(&self) -> &Arc<dyn DriveBackend> {
        self.registry.backend()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// Subscribes to the event fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.bus.subscribe()
    }

    pub async fn list(&self) -> EngineResult<Vec<Transfer>> {
        self.store.transfers.list().await
    }

    pub async fn get(&self, id: &TransferId) -> EngineResult<Transfer> {
        self.store.transfers.get(id).await
    }

    /// Startup reconcile: anything that was in flight when the process
    /// died comes back paused, never silently running.
    pub async fn reconcile_on_startup(&self) -> EngineResult<usize> {
        let demoted = self
            .store
            .transfers
            .update_matching(
                |t| {
                    matches!(
                        t.status,
                        TransferStatus::Running | TransferStatus::Pending
                    )
                },
                |t| t.status = TransferStatus::Paused,
            )
            .await?;
        if !demoted.is_empty() {
            info!(count = demoted.len(), "Demoted in-flight transfers to paused");
        }
        Ok(demoted.len())
    }

    /// Dispatcher loop: drains the queue, gating each transfer on its
    /// direction pool and tenant cap. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Transfer engine run() called twice, ignoring");
                return;
            }
        };
        info!(
            workers_per_direction = self.config.workers_per_direction,
            per_tenant = self.config.per_tenant_parallelism,
            "Transfer engine starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Transfer engine stopping");
                    break;
                }
                next = rx.recv() => {
                    match next {
                        Some(id) => {
                            let engine = Arc::clone(&self);
                            tokio::spawn(async move { engine.execute(id).await });
                        }
                        None => break,
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Enqueue operations
    // ------------------------------------------------------------------

    /// Queues a single-file upload. When `parent_token` is absent the
    /// router picks a capacity-checked write root.
    pub async fn enqueue_file_upload(
        &self,
        scope: &AccessScope,
        local_path: &Path,
        parent_token: Option<String>,
    ) -> EngineResult<Transfer> {
        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_file() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a file",
                local_path.display()
            )));
        }
        let file_name = file_name_of(local_path)?;
        let (tenant, parent) = self
            .resolve_upload_parent(scope, parent_token, metadata.len())
            .await?;
        self.registry
            .assert_unique_name(&tenant, &parent, &file_name)
            .await?;

        let mut record = Transfer::new(TransferKind::FileUpload, file_name);
        record.tenant_id = Some(tenant.id);
        record.parent_token = Some(parent);
        record.local_path = Some(local_path.to_string_lossy().into_owned());
        record.size = metadata.len();
        self.admit(record).await
    }

    /// Queues a folder upload; the folder's own name is mirrored under the
    /// chosen parent and each leaf file becomes a child transfer.
    pub async fn enqueue_folder_upload(
        &self,
        scope: &AccessScope,
        local_dir: &Path,
        parent_token: Option<String>,
    ) -> EngineResult<Transfer> {
        let metadata = tokio::fs::metadata(local_dir).await?;
        if !metadata.is_dir() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a directory",
                local_dir.display()
            )));
        }
        let total = local_tree_size(local_dir).await?;
        let name = file_name_of(local_dir)?;
        let (tenant, parent) = self
            .resolve_upload_parent(scope, parent_token, total)
            .await?;

        let mut record = Transfer::new(TransferKind::FolderUpload, name);
        record.tenant_id = Some(tenant.id);
        record.parent_token = Some(parent);
        record.local_path = Some(local_dir.to_string_lossy().into_owned());
        record.size = total;
        self.admit(record).await
    }

    /// Queues a single-file download into `dest_dir`.
    pub async fn enqueue_file_download(
        &self,
        scope: &AccessScope,
        token: &str,
        dest_dir: &Path,
        file_name: &str,
    ) -> EngineResult<Transfer> {
        let tenant = self.registry.tenant_for_token(scope, token).await?;
        let mut record = Transfer::new(TransferKind::FileDownload, file_name.to_string());
        record.tenant_id = Some(tenant.id);
        record.resource_token = Some(token.to_string());
        record.local_path = Some(dest_dir.join(file_name).to_string_lossy().into_owned());
        self.admit(record).await
    }

    /// Queues a folder download mirrored under `dest_dir/<folder_name>`.
    pub async fn enqueue_folder_download(
        &self,
        scope: &AccessScope,
        folder_token: &str,
        dest_dir: &Path,
        folder_name: &str,
    ) -> EngineResult<Transfer> {
        let tenant = self.registry.tenant_for_token(scope, folder_token).await?;
        let mut record = Transfer::new(TransferKind::FolderDownload, folder_name.to_string());
        record.tenant_id = Some(tenant.id);
        record.resource_token = Some(folder_token.to_string());
        record.local_path = Some(dest_dir.join(folder_name).to_string_lossy().into_owned());
        self.admit(record).await
    }

    async fn resolve_upload_parent(
        &self,
        scope: &AccessScope,
        parent_token: Option<String>,
        required_bytes: u64,
    ) -> EngineResult<(Tenant, String)> {
        match parent_token {
            Some(parent) => {
                let tenant = self.registry.tenant_for_token(scope, &parent).await?;
                tenant.ensure_writable()?;
                Ok((tenant, parent))
            }
            None => self.registry.resolve_write_root(scope, required_bytes).await,
        }
    }

    /// Persists a fresh record and places it on the queue.
    async fn admit(&self, record: Transfer) -> EngineResult<Transfer> {
        let id = record.id;
        self.store.transfers.insert(record.clone()).await?;
        self.bus.publish(record.clone());
        self.enqueue_id(id);
        Ok(record)
    }

    fn enqueue_id(&self, id: TransferId) {
        if self.queue_tx.send(id).is_err() {
            warn!(transfer_id = %id, "Transfer queue closed, record stays pending");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle commands
    // ------------------------------------------------------------------

    /// Pauses a transfer at the next block boundary.
    pub async fn pause(&self, id: &TransferId) -> EngineResult<Transfer> {
        self.control(id).pause();
        self.persist(id, |t| {
            if matches!(
                t.status,
                TransferStatus::Running | TransferStatus::Pending
            ) {
                t.status = TransferStatus::Paused;
            }
        })
        .await
    }

    /// Resumes a paused transfer from its durable checkpoint.
    pub async fn resume(&self, id: &TransferId) -> EngineResult<Transfer> {
        let record = self.store.transfers.get(id).await?;
        match record.status {
            TransferStatus::Paused => {
                // Fresh control: the old pause/cancel flags must not leak
                // into the resumed run.
                self.controls.remove(id);
                self.enqueue_id(*id);
                Ok(record)
            }
            TransferStatus::Pending | TransferStatus::Running => Ok(record),
            status => Err(EngineError::Conflict(format!(
                "transfer is {status:?}, only paused transfers resume"
            ))),
        }
    }

    /// Cancels a transfer; it reaches `failed` within one block.
    pub async fn cancel(&self, id: &TransferId) -> EngineResult<Transfer> {
        self.control(id).cancel();
        let record = self
            .persist(id, |t| {
                if !t.status.is_terminal() {
                    t.status = TransferStatus::Failed;
                    t.message = Some("cancelled".into());
                }
            })
            .await?;
        // Best-effort upstream session abort.
        if let Some(ResumePayload::UploadFile { upload_id, .. }) = record.resume.clone() {
            if let Some(tenant_id) = record.tenant_id {
                if let Ok(tenant) = self.store.tenants.get(&tenant_id).await {
                    let _ = self.backend().upload_abort(&tenant, &upload_id).await;
                }
            }
        }
        Ok(record)
    }

    /// Clones a failed transfer into a fresh pending record.
    pub async fn restart(&self, id: &TransferId) -> EngineResult<Transfer> {
        let record = self.store.transfers.get(id).await?;
        if record.status != TransferStatus::Failed {
            return Err(EngineError::Conflict(
                "only failed transfers can restart".into(),
            ));
        }
        self.admit(record.restarted()).await
    }

    /// Removes one finished (or parked) record.
    pub async fn delete(&self, id: &TransferId) -> EngineResult<()> {
        let record = self.store.transfers.get(id).await?;
        if record.status == TransferStatus::Running {
            return Err(EngineError::Conflict(
                "cancel the transfer before deleting it".into(),
            ));
        }
        self.controls.remove(id);
        self.store.transfers.remove(id).await
    }

    /// Bulk history cleanup. Modes: `success`, `failed`, `finished`, `all`.
    /// Running records are never removed.
    pub async fn clear(&self, mode: &str) -> EngineResult<usize> {
        let mode = mode.to_string();
        let removed = self
            .store
            .transfers
            .remove_matching(move |t| {
                let selected = match mode.as_str() {
                    "success" => t.status == TransferStatus::Success,
                    "failed" => t.status == TransferStatus::Failed,
                    "finished" | "" => t.status.is_terminal(),
                    "all" => true,
                    _ => false,
                };
                selected && t.status != TransferStatus::Running
            })
            .await?;
        Ok(removed)
    }

    /// Fails every non-terminal transfer bound to a removed tenant.
    pub async fn fail_tenant_transfers(&self, tenant_id: &TenantId) -> EngineResult<usize> {
        let tenant_id = *tenant_id;
        let affected = self
            .store
            .transfers
            .update_matching(
                move |t| t.tenant_id == Some(tenant_id) && !t.status.is_terminal(),
                |t| {
                    t.status = TransferStatus::Failed;
                    t.message = Some("tenant removed".into());
                    t.resume = None;
                },
            )
            .await?;
        for record in &affected {
            self.control(&record.id).cancel();
            self.bus.publish(record.clone());
        }
        Ok(affected.len())
    }

    /// Blocks until the transfer reaches a terminal state.
    pub async fn wait_terminal(&self, id: &TransferId) -> EngineResult<Transfer> {
        let mut rx = self.subscribe();
        loop {
            let record = self.store.transfers.get(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            match tokio::time::timeout(std::time::Duration::from_millis(250), rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.transfer.id == *id && event.transfer.status.is_terminal() {
                        return Ok(event.transfer);
                    }
                }
                // Lag or closure: fall back to polling the record.
                Ok(Err(_)) | Err(_) => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync-runner entry points
    // ------------------------------------------------------------------

    /// Uploads one file on behalf of a sync run and waits for the result.
    pub async fn sync_upload_file(
        &self,
        task_id: TaskId,
        tenant: &Tenant,
        parent_token: &str,
        local_file: &Path,
        file_name: &str,
    ) -> EngineResult<Transfer> {
        let metadata = tokio::fs::metadata(local_file).await?;
        let mut record = Transfer::new(TransferKind::FileUpload, file_name.to_string());
        record.tenant_id = Some(tenant.id);
        record.parent_token = Some(parent_token.to_string());
        record.local_path = Some(local_file.to_string_lossy().into_owned());
        record.size = metadata.len();
        record.sync_task_id = Some(task_id);
        let admitted = self.admit(record).await?;
        self.wait_terminal(&admitted.id).await
    }

    /// Downloads one file on behalf of a sync run and waits for the result.
    pub async fn sync_download_file(
        &self,
        task_id: TaskId,
        tenant: &Tenant,
        token: &str,
        dest_dir: &Path,
        file_name: &str,
        expected_size: Option<u64>,
    ) -> EngineResult<Transfer> {
        let mut record = Transfer::new(TransferKind::FileDownload, file_name.to_string());
        record.tenant_id = Some(tenant.id);
        record.resource_token = Some(token.to_string());
        record.local_path = Some(dest_dir.join(file_name).to_string_lossy().into_owned());
        record.size = expected_size.unwrap_or(0);
        record.sync_task_id = Some(task_id);
        // Sync replaces the local file in place; no ` (n)` suffixing.
        record.remote_path = Some(file_name.to_string());
        let admitted = self.admit(record).await?;
        self.wait_terminal(&admitted.id).await
    }

    // ------------------------------------------------------------------
    // Worker execution
    // ------------------------------------------------------------------

    fn control(&self, id: &TransferId) -> Arc<TransferControl> {
        self.controls
            .entry(*id)
            .or_insert_with(|| Arc::new(TransferControl::new()))
            .clone()
    }

    fn tenant_slot(&self, tenant_id: &TenantId) -> Arc<Semaphore> {
        self.tenant_slots
            .entry(*tenant_id)
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.per_tenant_parallelism.max(1)))
            })
            .clone()
    }

    async fn execute(self: Arc<Self>, id: TransferId) {
        let record = match self.store.transfers.get(&id).await {
            Ok(record) => record,
            Err(_) => {
                debug!(transfer_id = %id, "Queued transfer vanished before start");
                return;
            }
        };
        if record.status.is_terminal() {
            return;
        }

        // Folder transfers only orchestrate; their children take the
        // direction and tenant permits, so holding one here would
        // deadlock the pool.
        let is_folder = matches!(
            record.kind,
            TransferKind::FolderUpload | TransferKind::FolderDownload
        );
        let _direction_permit = if is_folder {
            None
        } else {
            let pool = match record.direction {
                muxdrive_core::domain::TransferDirection::Upload => &self.upload_slots,
                muxdrive_core::domain::TransferDirection::Download => &self.download_slots,
            };
            match Arc::clone(pool).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            }
        };
        let _tenant_permit = match (is_folder, record.tenant_id) {
            (false, Some(tenant_id)) => {
                match self.tenant_slot(&tenant_id).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                }
            }
            _ => None,
        };

        // The command layer may have paused or cancelled while we waited
        // for a slot.
        let control = self.control(&id);
        match control.gate() {
            ControlGate::Cancelled => return,
            ControlGate::Paused => return,
            ControlGate::Proceed => {}
        }

        if self
            .persist(&id, |t| {
                t.status = TransferStatus::Running;
                t.message = None;
            })
            .await
            .is_err()
        {
            return;
        }

        let outcome = match record.kind {
            TransferKind::FileUpload => self.run_file_upload(&id, &control).await,
            TransferKind::FileDownload => self.run_file_download(&id, &control).await,
            TransferKind::FolderUpload => self.run_folder_upload(&id, &control).await,
            TransferKind::FolderDownload => self.run_folder_download(&id, &control).await,
        };

        match outcome {
            Ok(Outcome::Completed) => {
                let _ = self
                    .persist(&id, |t| {
                        t.status = TransferStatus::Success;
                        t.resume = None;
                        t.message = None;
                    })
                    .await;
                self.controls.remove(&id);
            }
            Ok(Outcome::Paused) => {
                // Status was already set by the pause command; keep the
                // resume payload for the next run.
                debug!(transfer_id = %id, "Transfer parked at block boundary");
            }
            Err(EngineError::Cancelled) => {
                let _ = self
                    .persist(&id, |t| {
                        if !t.status.is_terminal() {
                            t.status = TransferStatus::Failed;
                            t.message = Some("cancelled".into());
                        }
                    })
                    .await;
                self.controls.remove(&id);
            }
            Err(err) => {
                warn!(transfer_id = %id, error = %err, "Transfer failed");
                let message = err.to_string();
                let _ = self
                    .persist(&id, |t| {
                        if !t.status.is_terminal() {
                            t.status = TransferStatus::Failed;
                            t.message = Some(message.clone());
                        }
                    })
                    .await;
                self.controls.remove(&id);
            }
        }
    }

    /// Persists a mutation and publishes the updated record.
    async fn persist(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut Transfer),
    ) -> EngineResult<Transfer> {
        let record = self.store.transfers.update(id, f).await?;
        self.bus.publish(record.clone());
        if record.status.is_terminal() {
            self.bus.forget(id);
        }
        Ok(record)
    }

    // ------------------------------------------------------------------
    // File upload
    // ------------------------------------------------------------------

    async fn run_file_upload(
        &self,
        id: &TransferId,
        control: &TransferControl,
    ) -> EngineResult<Outcome> {
        let record = self.store.transfers.get(id).await?;
        let tenant_id = record
            .tenant_id
            .ok_or_else(|| EngineError::InvalidArgument("upload has no tenant".into()))?;
        let tenant = self.store.tenants.get(&tenant_id).await?;
        tenant.ensure_writable()?;
        let parent_token = record
            .parent_token
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("upload has no parent folder".into()))?;
        let local_path = PathBuf::from(
            record
                .local_path
                .clone()
                .ok_or_else(|| EngineError::InvalidArgument("upload has no local path".into()))?,
        );

        let metadata = tokio::fs::metadata(&local_path).await?;
        let size = metadata.len();
        let policy = self.retry_policy();

        // Open or recover the upload session.
        let (upload_id, block_size, mut next_seq) = match record.resume.clone() {
            Some(ResumePayload::UploadFile {
                upload_id,
                block_size,
                next_seq,
                ..
            }) => (upload_id, block_size.max(1), next_seq),
            _ => {
                let session = with_retry("upload_init", policy, || {
                    self.backend()
                        .upload_init(&tenant, &parent_token, &record.name, size)
                })
                .await?;
                (session.upload_id, session.block_size.max(1), 0)
            }
        };

        let mut transferred = (block_size * next_seq).min(size);
        let checkpoint = |seq: u64| ResumePayload::UploadFile {
            upload_id: upload_id.clone(),
            block_size,
            next_seq: seq,
            parent_token: parent_token.clone(),
            file_path: local_path.to_string_lossy().into_owned(),
            file_name: record.name.clone(),
            size,
        };
        let initial = checkpoint(next_seq);
        self.persist(id, |t| {
            t.size = size;
            t.transferred = transferred;
            t.resume = Some(initial);
        })
        .await?;

        let mut file = tokio::fs::File::open(&local_path).await?;
        file.seek(std::io::SeekFrom::Start(transferred)).await?;

        while transferred < size {
            match control.gate() {
                ControlGate::Cancelled => return Err(EngineError::Cancelled),
                ControlGate::Paused => return Ok(Outcome::Paused),
                ControlGate::Proceed => {}
            }

            let read_len = (size - transferred).min(block_size) as usize;
            let mut block = vec![0u8; read_len];
            file.read_exact(&mut block).await?;

            let seq = next_seq;
            with_retry("upload_block", policy, || {
                // Idempotent on (upload_id, seq): a retried block lands once.
                self.backend()
                    .upload_block(&tenant, &upload_id, seq, block.clone())
            })
            .await?;

            next_seq += 1;
            transferred += read_len as u64;
            let progress = checkpoint(next_seq);
            self.persist(id, |t| {
                t.transferred = transferred;
                t.resume = Some(progress);
            })
            .await?;
        }

        // Zero-byte files seal with zero blocks.
        let block_count = next_seq;
        let file_token = with_retry("upload_finish", policy, || {
            self.backend().upload_finish(&tenant, &upload_id, block_count)
        })
        .await?;
        self.store
            .resources
            .register(file_token, tenant.id)
            .await?;
        Ok(Outcome::Completed)
    }

    // ------------------------------------------------------------------
    // File download
    // ------------------------------------------------------------------

    async fn run_file_download(
        &self,
        id: &TransferId,
        control: &TransferControl,
    ) -> EngineResult<Outcome> {
        let record = self.store.transfers.get(id).await?;
        let tenant_id = record
            .tenant_id
            .ok_or_else(|| EngineError::InvalidArgument("download has no tenant".into()))?;
        let tenant = self.store.tenants.get(&tenant_id).await?;
        let token = record
            .resource_token
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("download has no file token".into()))?;
        let policy = self.retry_policy();

        // Resolve target/temp paths, preferring the durable checkpoint.
        let (target, temp, mut downloaded) = match record.resume.clone() {
            Some(ResumePayload::DownloadFile {
                temp_path,
                target_path,
                downloaded,
                ..
            }) => (
                PathBuf::from(target_path),
                PathBuf::from(temp_path),
                downloaded,
            ),
            _ => {
                let hinted = PathBuf::from(record.local_path.clone().ok_or_else(|| {
                    EngineError::InvalidArgument("download has no destination".into())
                })?);
                let dir = hinted
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                tokio::fs::create_dir_all(&dir).await?;
                // Sync-run downloads replace in place; interactive ones
                // pick a fresh ` (n)` name.
                let target = if record.sync_task_id.is_some() {
                    hinted
                } else {
                    unique_target(&dir, &record.name).await?
                };
                let temp = part_path(&target);
                let downloaded = match tokio::fs::metadata(&temp).await {
                    Ok(meta) => meta.len(),
                    Err(_) => 0,
                };
                (target, temp, downloaded)
            }
        };

        let mut size = record.size;
        if size == 0 {
            let meta = with_retry("metadata", policy, || {
                self.backend().metadata(&tenant, &token)
            })
            .await?;
            size = meta.size.unwrap_or(0);
        }

        let target_str = target.to_string_lossy().into_owned();
        let checkpoint = |done: u64| ResumePayload::DownloadFile {
            temp_path: temp.to_string_lossy().into_owned(),
            target_path: target_str.clone(),
            downloaded: done,
            token: token.clone(),
            file_name: record.name.clone(),
        };
        let initial = checkpoint(downloaded);
        self.persist(id, |t| {
            t.size = size;
            t.transferred = downloaded;
            t.local_path = Some(target_str.clone());
            t.resume = Some(initial);
        })
        .await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&temp)
            .await?;
        file.seek(std::io::SeekFrom::Start(downloaded)).await?;

        let block = self.config.download_block_size.max(1);
        loop {
            if size > 0 && downloaded >= size {
                break;
            }
            match control.gate() {
                ControlGate::Cancelled => return Err(EngineError::Cancelled),
                ControlGate::Paused => {
                    file.flush().await?;
                    return Ok(Outcome::Paused);
                }
                ControlGate::Proceed => {}
            }

            let want = if size > 0 {
                (size - downloaded).min(block)
            } else {
                block
            };
            let chunk = with_retry("download_range", policy, || {
                self.backend()
                    .download_range(&tenant, &token, downloaded, want)
            })
            .await?;
            if chunk.is_empty() {
                if size > 0 && downloaded < size {
                    return Err(EngineError::UpstreamPermanent(format!(
                        "stream ended at {downloaded} of {size} bytes"
                    )));
                }
                // End of stream for unknown-size downloads.
                break;
            }
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            let progress = checkpoint(downloaded);
            self.persist(id, |t| {
                t.transferred = downloaded;
                if t.size < downloaded {
                    t.size = downloaded;
                }
                t.resume = Some(progress);
            })
            .await?;
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&temp, &target).await?;
        if size == 0 {
            self.persist(id, |t| {
                t.size = downloaded;
                t.transferred = downloaded;
            })
            .await?;
        }
        Ok(Outcome::Completed)
    }

    // ------------------------------------------------------------------
    // Folder transfers
    // ------------------------------------------------------------------

    async fn run_folder_upload(
        &self,
        id: &TransferId,
        control: &TransferControl,
    ) -> EngineResult<Outcome> {
        let record = self.store.transfers.get(id).await?;
        let tenant_id = record
            .tenant_id
            .ok_or_else(|| EngineError::InvalidArgument("upload has no tenant".into()))?;
        let tenant = self.store.tenants.get(&tenant_id).await?;
        tenant.ensure_writable()?;
        let parent = record
            .parent_token
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("upload has no parent folder".into()))?;
        let local_dir = PathBuf::from(
            record
                .local_path
                .clone()
                .ok_or_else(|| EngineError::InvalidArgument("upload has no local path".into()))?,
        );

        // Mirror directories top-down, then upload leaves. Re-running a
        // resumed folder reuses folders that already exist.
        let root_token = self
            .ensure_remote_folder(&tenant, &parent, &record.name)
            .await?;
        let mut pending: Vec<(PathBuf, String)> = vec![(local_dir.clone(), root_token)];
        let mut files: Vec<(PathBuf, String, String)> = Vec::new();
        while let Some((dir, remote)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if file_type.is_dir() {
                    let child = self.ensure_remote_folder(&tenant, &remote, &name).await?;
                    pending.push((entry.path(), child));
                } else if file_type.is_file() {
                    files.push((entry.path(), remote.clone(), name));
                }
            }
        }

        let mut completed: u64 = 0;
        for (path, remote_parent, name) in files {
            match control.gate() {
                ControlGate::Cancelled => return Err(EngineError::Cancelled),
                ControlGate::Paused => return Ok(Outcome::Paused),
                ControlGate::Proceed => {}
            }
            let metadata = tokio::fs::metadata(&path).await?;
            let mut child = Transfer::new(TransferKind::FileUpload, name.clone());
            child.tenant_id = Some(tenant.id);
            child.parent_token = Some(remote_parent);
            child.local_path = Some(path.to_string_lossy().into_owned());
            child.size = metadata.len();
            child.sync_task_id = record.sync_task_id;
            let admitted = self.admit(child).await?;
            let finished = self.wait_terminal(&admitted.id).await?;
            if finished.status != TransferStatus::Success {
                return Err(EngineError::UpstreamPermanent(format!(
                    "child upload '{name}' failed: {}",
                    finished.message.unwrap_or_default()
                )));
            }
            completed += finished.size;
            self.persist(id, |t| t.transferred = completed).await?;
        }
        Ok(Outcome::Completed)
    }

    async fn run_folder_download(
        &self,
        id: &TransferId,
        control: &TransferControl,
    ) -> EngineResult<Outcome> {
        let record = self.store.transfers.get(id).await?;
        let tenant_id = record
            .tenant_id
            .ok_or_else(|| EngineError::InvalidArgument("download has no tenant".into()))?;
        let tenant = self.store.tenants.get(&tenant_id).await?;
        let root_token = record
            .resource_token
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("download has no folder token".into()))?;
        let dest_root = PathBuf::from(
            record
                .local_path
                .clone()
                .ok_or_else(|| EngineError::InvalidArgument("download has no destination".into()))?,
        );
        let policy = self.retry_policy();

        let mut queue: Vec<(String, PathBuf)> = vec![(root_token, dest_root)];
        let mut total: u64 = 0;
        let mut completed: u64 = 0;
        while let Some((token, dir)) = queue.pop() {
            tokio::fs::create_dir_all(&dir).await?;
            let entries = with_retry("list_folder", policy, || {
                self.backend().list_folder(&tenant, &token)
            })
            .await?;
            for entry in entries {
                match control.gate() {
                    ControlGate::Cancelled => return Err(EngineError::Cancelled),
                    ControlGate::Paused => return Ok(Outcome::Paused),
                    ControlGate::Proceed => {}
                }
                if entry.kind == EntryKind::Folder {
                    queue.push((entry.token.clone(), dir.join(&entry.name)));
                    continue;
                }
                total += entry.size.unwrap_or(0);
                self.persist(id, |t| t.size = total).await?;

                let mut child = Transfer::new(TransferKind::FileDownload, entry.name.clone());
                child.tenant_id = Some(tenant.id);
                child.resource_token = Some(entry.token.clone());
                child.local_path = Some(dir.join(&entry.name).to_string_lossy().into_owned());
                child.size = entry.size.unwrap_or(0);
                child.sync_task_id = record.sync_task_id;
                let admitted = self.admit(child).await?;
                let finished = self.wait_terminal(&admitted.id).await?;
                if finished.status != TransferStatus::Success {
                    return Err(EngineError::UpstreamPermanent(format!(
                        "child download '{}' failed: {}",
                        entry.name,
                        finished.message.unwrap_or_default()
                    )));
                }
                completed += finished.size;
                self.persist(id, |t| t.transferred = completed).await?;
            }
        }
        Ok(Outcome::Completed)
    }

    /// Returns the token of `name` under `parent`, creating the folder if
    /// it does not exist yet.
    async fn ensure_remote_folder(
        &self,
        tenant: &Tenant,
        parent: &str,
        name: &str,
    ) -> EngineResult<String> {
        let entries = self.backend().list_folder(tenant, parent).await?;
        if let Some(existing) = entries
            .iter()
            .find(|e| e.name == name && e.kind == EntryKind::Folder)
        {
            return Ok(existing.token.clone());
        }
        if entries.iter().any(|e| e.name == name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        let token = self.backend().create_folder(tenant, parent, name).await?;
        self.store
            .resources
            .register(token.clone(), tenant.id)
            .await?;
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

fn file_name_of(path: &Path) -> EngineResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            EngineError::InvalidArgument(format!("{} has no file name", path.display()))
        })
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    name.push_str(".part");
    target.with_file_name(name)
}

/// Picks `dir/name`, appending ` (n)` before the extension with the
/// smallest `n >= 1` that makes the name unique.
async fn unique_target(dir: &Path, name: &str) -> EngineResult<PathBuf> {
    let candidate = dir.join(name);
    if tokio::fs::metadata(&candidate).await.is_err() {
        return Ok(candidate);
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };
    for n in 1u32.. {
        let next = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(next);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return Ok(candidate);
        }
    }
    unreachable!("u32 range exhausted before finding a unique name")
}

/// Total size of every regular file under `dir`.
async fn local_tree_size(dir: &Path) -> EngineResult<u64> {
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }
    Ok(total)
}
