//! End-to-end tests for the transfer engine against an in-memory drive

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use muxdrive_core::config::TransferConfig;
use muxdrive_core::domain::{
    Platform, ResumePayload, Tenant, TenantPermission, Transfer, TransferKind, TransferStatus,
};
use muxdrive_core::ports::{
    DriveBackend, EntryKind, EntryMetadata, QuotaUsage, RemoteEntry, RootListing, UploadSession,
};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::registry::NewTenant;
use muxdrive_router::{AccessScope, TenantRegistry};
use muxdrive_store::Store;
use muxdrive_transfer::TransferEngine;

const BLOCK: u64 = 1_048_576;

#[derive(Default)]
struct UploadState {
    blocks: BTreeMap<u64, Vec<u8>>,
    file_name: String,
}

/// In-memory drive implementing the chunked upload and ranged download
/// protocol, with short reads to exercise the read loop.
#[derive(Default)]
struct MockDrive {
    sessions: Mutex<HashMap<String, UploadState>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    folders: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    next_upload: AtomicU32,
    block_calls: AtomicU32,
    finish_calls: AtomicU32,
    /// Cap on a single download_range response.
    short_read_cap: u64,
}

impl MockDrive {
    fn with_short_reads(cap: u64) -> Self {
        Self {
            short_read_cap: cap,
            ..Self::default()
        }
    }

    fn seed_session(&self, upload_id: &str, name: &str, blocks: BTreeMap<u64, Vec<u8>>) {
        self.sessions.lock().unwrap().insert(
            upload_id.to_string(),
            UploadState {
                blocks,
                file_name: name.to_string(),
            },
        );
    }

    fn seed_file(&self, token: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(token.to_string(), bytes);
    }

    fn stored_file(&self, name: &str) -> Option<Vec<u8>> {
        let files = self.files.lock().unwrap();
        files.get(name).cloned()
    }
}

#[async_trait]
impl DriveBackend for MockDrive {
    async fn list_root(&self, _tenant: &Tenant) -> EngineResult<RootListing> {
        Ok(RootListing {
            root_token: "root".into(),
            entries: Vec::new(),
        })
    }

    async fn list_folder(
        &self,
        _tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        Ok(self
            .folders
            .lock()
            .unwrap()
            .get(folder_token)
            .cloned()
            .unwrap_or_default())
    }

    async fn metadata(&self, _tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata> {
        let files = self.files.lock().unwrap();
        let bytes = files
            .get(token)
            .ok_or_else(|| EngineError::NotFound(format!("token {token}")))?;
        Ok(EntryMetadata {
            size: Some(bytes.len() as u64),
            mtime: None,
            checksum: None,
        })
    }

    async fn create_folder(
        &self,
        _tenant: &Tenant,
        parent_token: &str,
        name: &str,
    ) -> EngineResult<String> {
        let token = format!("fld_{name}");
        let mut folders = self.folders.lock().unwrap();
        folders.entry(parent_token.to_string()).or_default().push(RemoteEntry {
            token: token.clone(),
            name: name.into(),
            kind: EntryKind::Folder,
            parent_token: Some(parent_token.into()),
            size: None,
            mtime: None,
        });
        Ok(token)
    }

    async fn move_entry(&self, _t: &Tenant, _token: &str, _p: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn copy_entry(
        &self,
        _t: &Tenant,
        _token: &str,
        _p: &str,
        n: &str,
    ) -> EngineResult<String> {
        Ok(format!("copy_{n}"))
    }

    async fn rename_entry(&self, _t: &Tenant, _token: &str, _n: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn delete_entry(&self, _t: &Tenant, _token: &str, _k: EntryKind) -> EngineResult<()> {
        Ok(())
    }

    async fn upload_init(
        &self,
        _tenant: &Tenant,
        _parent_token: &str,
        file_name: &str,
        _size: u64,
    ) -> EngineResult<UploadSession> {
        let n = self.next_upload.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("up_{n}");
        self.seed_session(&upload_id, file_name, BTreeMap::new());
        Ok(UploadSession {
            upload_id,
            block_size: BLOCK,
        })
    }

    async fn upload_block(
        &self,
        _tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::UpstreamPermanent("unknown upload".into()))?;
        // Idempotent on (upload_id, seq).
        session.blocks.insert(seq, bytes);
        Ok(())
    }

    async fn upload_finish(
        &self,
        _tenant: &Tenant,
        upload_id: &str,
        block_count: u64,
    ) -> EngineResult<String> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .remove(upload_id)
            .ok_or_else(|| EngineError::UpstreamPermanent("unknown upload".into()))?;
        if session.blocks.len() as u64 != block_count {
            return Err(EngineError::UpstreamPermanent(format!(
                "expected {block_count} blocks, got {}",
                session.blocks.len()
            )));
        }
        let mut assembled = Vec::new();
        for (_, block) in session.blocks {
            assembled.extend_from_slice(&block);
        }
        let token = format!("file_{}", session.file_name);
        self.files
            .lock()
            .unwrap()
            .insert(session.file_name, assembled);
        Ok(token)
    }

    async fn upload_abort(&self, _tenant: &Tenant, upload_id: &str) -> EngineResult<()> {
        self.sessions.lock().unwrap().remove(upload_id);
        Ok(())
    }

    async fn download_range(
        &self,
        _tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>> {
        let files = self.files.lock().unwrap();
        let bytes = files
            .get(token)
            .ok_or_else(|| EngineError::NotFound(format!("token {token}")))?;
        let start = (offset as usize).min(bytes.len());
        let mut want = len;
        if self.short_read_cap > 0 {
            want = want.min(self.short_read_cap);
        }
        let end = (start + want as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn quota(&self, tenant: &Tenant) -> EngineResult<QuotaUsage> {
        Ok(QuotaUsage {
            used_bytes: tenant.used_bytes,
            total_bytes: tenant.quota_bytes,
        })
    }
}

struct Harness {
    store: Arc<Store>,
    drive: Arc<MockDrive>,
    engine: Arc<TransferEngine>,
    tenant: Tenant,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(drive: MockDrive) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let drive = Arc::new(drive);
        let registry = Arc::new(TenantRegistry::new(
            Arc::clone(&store),
            Arc::clone(&drive) as Arc<dyn DriveBackend>,
        ));
        let tenant = registry
            .add_tenant(NewTenant {
                display_name: "t1".into(),
                app_id: "app".into(),
                app_secret: "secret".into(),
                platform: Platform::Intl,
                quota_bytes: 100 * 1024 * 1024 * 1024,
                permission: TenantPermission::ReadWrite,
            })
            .await
            .unwrap();
        // Make a parent folder addressable.
        store.resources.register("parent", tenant.id).await.unwrap();

        let config = TransferConfig {
            retry_base_ms: 1,
            retry_cap_ms: 2,
            ..TransferConfig::default()
        };
        let engine = TransferEngine::new(Arc::clone(&store), registry, config);
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
        Self {
            store,
            drive,
            engine,
            tenant,
            shutdown,
            _dir: dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_upload_roundtrip_small_file() {
    let h = Harness::new(MockDrive::default()).await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("hello.txt");
    tokio::fs::write(&src, b"hello world").await.unwrap();

    let record = h
        .engine
        .enqueue_file_upload(&AccessScope::Admin, &src, Some("parent".into()))
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(finished.transferred, 11);
    assert!(finished.resume.is_none());
    assert_eq!(h.drive.stored_file("hello.txt").unwrap(), b"hello world");
}

#[tokio::test]
async fn test_upload_exact_block_multiple_has_no_tail() {
    let h = Harness::new(MockDrive::default()).await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("even.bin");
    let content = pattern_bytes((BLOCK * 3) as usize);
    tokio::fs::write(&src, &content).await.unwrap();

    let record = h
        .engine
        .enqueue_file_upload(&AccessScope::Admin, &src, Some("parent".into()))
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(h.drive.block_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.drive.stored_file("even.bin").unwrap(), content);
}

#[tokio::test]
async fn test_empty_file_uploads_with_zero_blocks() {
    let h = Harness::new(MockDrive::default()).await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("empty.bin");
    tokio::fs::write(&src, b"").await.unwrap();

    let record = h
        .engine
        .enqueue_file_upload(&AccessScope::Admin, &src, Some("parent".into()))
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(finished.transferred, 0);
    assert_eq!(h.drive.block_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.drive.finish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.drive.stored_file("empty.bin").unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_resumed_upload_sends_only_remaining_block() {
    // 2,500,000-byte file, 1 MiB blocks. Blocks 0 and 1 are already
    // durable upstream; the paused record carries next_seq = 2. Resume
    // must send exactly one block of 403,328 bytes and finish once.
    let h = Harness::new(MockDrive::default()).await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("resume.bin");
    let content = pattern_bytes(2_500_000);
    tokio::fs::write(&src, &content).await.unwrap();

    let mut durable = BTreeMap::new();
    durable.insert(0u64, content[..BLOCK as usize].to_vec());
    durable.insert(1u64, content[BLOCK as usize..(2 * BLOCK) as usize].to_vec());
    h.drive.seed_session("up_seeded", "resume.bin", durable);

    let mut record = Transfer::new(TransferKind::FileUpload, "resume.bin".into());
    record.tenant_id = Some(h.tenant.id);
    record.parent_token = Some("parent".into());
    record.local_path = Some(src.to_string_lossy().into_owned());
    record.size = 2_500_000;
    record.transferred = 2_097_152;
    record.status = TransferStatus::Paused;
    record.resume = Some(ResumePayload::UploadFile {
        upload_id: "up_seeded".into(),
        block_size: BLOCK,
        next_seq: 2,
        parent_token: "parent".into(),
        file_path: src.to_string_lossy().into_owned(),
        file_name: "resume.bin".into(),
        size: 2_500_000,
    });
    let id = record.id;
    h.store.transfers.insert(record).await.unwrap();

    h.engine.resume(&id).await.unwrap();
    let finished = h.engine.wait_terminal(&id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(finished.transferred, 2_500_000);
    assert!(finished.resume.is_none());
    assert_eq!(h.drive.block_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.drive.finish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.drive.stored_file("resume.bin").unwrap(), content);
}

#[tokio::test]
async fn test_download_roundtrip_with_short_reads() {
    // The server returns at most 999,999 bytes per range call; the worker
    // must loop until the file is complete.
    let h = Harness::new(MockDrive::with_short_reads(999_999)).await;
    let content = pattern_bytes(2_500_000);
    h.drive.seed_file("tok_file", content.clone());
    h.store
        .resources
        .register("tok_file", h.tenant.id)
        .await
        .unwrap();

    let dest = tempfile::tempdir().unwrap();
    let record = h
        .engine
        .enqueue_file_download(&AccessScope::Admin, "tok_file", dest.path(), "data.bin")
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(finished.transferred, 2_500_000);
    let written = tokio::fs::read(dest.path().join("data.bin")).await.unwrap();
    assert_eq!(written, content);
    // No temp file left behind.
    assert!(!dest.path().join("data.bin.part").exists());
}

#[tokio::test]
async fn test_download_picks_unique_name() {
    let h = Harness::new(MockDrive::default()).await;
    h.drive.seed_file("tok_file", b"fresh".to_vec());
    h.store
        .resources
        .register("tok_file", h.tenant.id)
        .await
        .unwrap();

    let dest = tempfile::tempdir().unwrap();
    tokio::fs::write(dest.path().join("data.bin"), b"old")
        .await
        .unwrap();

    let record = h
        .engine
        .enqueue_file_download(&AccessScope::Admin, "tok_file", dest.path(), "data.bin")
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    let renamed = tokio::fs::read(dest.path().join("data (1).bin")).await.unwrap();
    assert_eq!(renamed, b"fresh");
    // The existing file is untouched.
    let original = tokio::fs::read(dest.path().join("data.bin")).await.unwrap();
    assert_eq!(original, b"old");
}

#[tokio::test]
async fn test_cancel_reaches_failed_with_message() {
    let h = Harness::new(MockDrive::default()).await;
    let mut record = Transfer::new(TransferKind::FileUpload, "x".into());
    record.tenant_id = Some(h.tenant.id);
    record.status = TransferStatus::Paused;
    let id = record.id;
    h.store.transfers.insert(record).await.unwrap();

    let cancelled = h.engine.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, TransferStatus::Failed);
    assert_eq!(cancelled.message.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_restart_clones_failed_record() {
    let h = Harness::new(MockDrive::default()).await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("retry.txt");
    tokio::fs::write(&src, b"retry me").await.unwrap();

    let mut record = Transfer::new(TransferKind::FileUpload, "retry.txt".into());
    record.tenant_id = Some(h.tenant.id);
    record.parent_token = Some("parent".into());
    record.local_path = Some(src.to_string_lossy().into_owned());
    record.size = 8;
    record.status = TransferStatus::Failed;
    record.message = Some("boom".into());
    let id = record.id;
    h.store.transfers.insert(record).await.unwrap();

    let fresh = h.engine.restart(&id).await.unwrap();
    assert_ne!(fresh.id, id);
    let finished = h.engine.wait_terminal(&fresh.id).await.unwrap();
    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(h.drive.stored_file("retry.txt").unwrap(), b"retry me");

    // Restart is only valid from failed.
    assert!(matches!(
        h.engine.restart(&fresh.id).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_startup_reconcile_demotes_inflight() {
    let h = Harness::new(MockDrive::default()).await;
    let mut running = Transfer::new(TransferKind::FileDownload, "r".into());
    running.status = TransferStatus::Running;
    let mut pending = Transfer::new(TransferKind::FileUpload, "p".into());
    pending.status = TransferStatus::Pending;
    let mut done = Transfer::new(TransferKind::FileUpload, "d".into());
    done.status = TransferStatus::Success;
    let (r_id, p_id, d_id) = (running.id, pending.id, done.id);
    h.store.transfers.insert(running).await.unwrap();
    h.store.transfers.insert(pending).await.unwrap();
    h.store.transfers.insert(done).await.unwrap();

    let demoted = h.engine.reconcile_on_startup().await.unwrap();
    assert_eq!(demoted, 2);
    assert_eq!(
        h.store.transfers.get(&r_id).await.unwrap().status,
        TransferStatus::Paused
    );
    assert_eq!(
        h.store.transfers.get(&p_id).await.unwrap().status,
        TransferStatus::Paused
    );
    assert_eq!(
        h.store.transfers.get(&d_id).await.unwrap().status,
        TransferStatus::Success
    );
}

#[tokio::test]
async fn test_tenant_removal_fails_bound_transfers() {
    let h = Harness::new(MockDrive::default()).await;
    let mut bound = Transfer::new(TransferKind::FileUpload, "bound".into());
    bound.tenant_id = Some(h.tenant.id);
    bound.status = TransferStatus::Paused;
    let id = bound.id;
    h.store.transfers.insert(bound).await.unwrap();

    let failed = h.engine.fail_tenant_transfers(&h.tenant.id).await.unwrap();
    assert_eq!(failed, 1);
    let record = h.store.transfers.get(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.message.as_deref(), Some("tenant removed"));
    assert!(record.resume.is_none());
}

#[tokio::test]
async fn test_folder_upload_mirrors_tree() {
    let h = Harness::new(MockDrive::default()).await;
    let src = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(src.path().join("album/nested"))
        .await
        .unwrap();
    tokio::fs::write(src.path().join("album/a.txt"), b"aa")
        .await
        .unwrap();
    tokio::fs::write(src.path().join("album/nested/b.txt"), b"bbb")
        .await
        .unwrap();

    let record = h
        .engine
        .enqueue_folder_upload(
            &AccessScope::Admin,
            &src.path().join("album"),
            Some("parent".into()),
        )
        .await
        .unwrap();
    let finished = h.engine.wait_terminal(&record.id).await.unwrap();

    assert_eq!(finished.status, TransferStatus::Success);
    assert_eq!(finished.size, 5);
    assert_eq!(finished.transferred, 5);
    assert_eq!(h.drive.stored_file("a.txt").unwrap(), b"aa");
    assert_eq!(h.drive.stored_file("b.txt").unwrap(), b"bbb");
    // Child transfers exist alongside the folder record.
    let all = h.engine.list().await.unwrap();
    let children: Vec<_> = all
        .iter()
        .filter(|t| t.kind == TransferKind::FileUpload)
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|t| t.status == TransferStatus::Success));
}

#[tokio::test]
async fn test_clear_keeps_unfinished_records() {
    let h = Harness::new(MockDrive::default()).await;
    let mut ok = Transfer::new(TransferKind::FileUpload, "ok".into());
    ok.status = TransferStatus::Success;
    let mut bad = Transfer::new(TransferKind::FileUpload, "bad".into());
    bad.status = TransferStatus::Failed;
    let mut parked = Transfer::new(TransferKind::FileUpload, "parked".into());
    parked.status = TransferStatus::Paused;
    h.store.transfers.insert(ok).await.unwrap();
    h.store.transfers.insert(bad).await.unwrap();
    h.store.transfers.insert(parked).await.unwrap();

    assert_eq!(h.engine.clear("success").await.unwrap(), 1);
    assert_eq!(h.engine.clear("finished").await.unwrap(), 1);
    let left = h.engine.list().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].status, TransferStatus::Paused);
}
