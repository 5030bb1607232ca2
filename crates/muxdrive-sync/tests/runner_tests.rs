//! End-to-end sync runner tests against an in-memory drive

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use muxdrive_core::config::TransferConfig;
use muxdrive_core::domain::{
    ConflictPolicy, DetectionMode, GroupId, Platform, SnapshotEntry, SyncDirection, SyncSnapshot,
    SyncTask, TaskId, TaskStatus, Tenant, TenantPermission,
};
use muxdrive_core::ports::{
    DriveBackend, EntryKind, EntryMetadata, QuotaUsage, RemoteEntry, RootListing, UploadSession,
};
use muxdrive_core::{EngineError, EngineResult};
use muxdrive_router::registry::NewTenant;
use muxdrive_router::TenantRegistry;
use muxdrive_store::Store;
use muxdrive_sync::SyncRunner;
use muxdrive_transfer::TransferEngine;

const ROOT: &str = "fld_root";

#[derive(Default)]
struct RemoteState {
    /// folder token -> entries.
    folders: HashMap<String, Vec<RemoteEntry>>,
    /// file token -> content.
    files: HashMap<String, Vec<u8>>,
    /// open upload sessions: id -> (parent, name, blocks).
    sessions: HashMap<String, (String, String, BTreeMap<u64, Vec<u8>>)>,
}

/// In-memory drive whose listings stay consistent with uploads/deletes.
struct MockDrive {
    state: Mutex<RemoteState>,
    next_token: AtomicU32,
    server_mtime: DateTime<Utc>,
}

impl MockDrive {
    fn new(server_mtime: DateTime<Utc>) -> Self {
        let mut state = RemoteState::default();
        state.folders.insert(ROOT.to_string(), Vec::new());
        Self {
            state: Mutex::new(state),
            next_token: AtomicU32::new(0),
            server_mtime,
        }
    }

    fn seed_file(&self, parent: &str, name: &str, bytes: Vec<u8>, mtime: DateTime<Utc>) -> String {
        let token = format!("tok_{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.folders.entry(parent.to_string()).or_default().push(RemoteEntry {
            token: token.clone(),
            name: name.to_string(),
            kind: EntryKind::File,
            parent_token: Some(parent.to_string()),
            size: Some(bytes.len() as u64),
            mtime: Some(mtime),
        });
        state.files.insert(token.clone(), bytes);
        token
    }

    fn file_names(&self, parent: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .folders
            .get(parent)
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }

    fn content_by_name(&self, parent: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let token = state
            .folders
            .get(parent)?
            .iter()
            .find(|e| e.name == name)?
            .token
            .clone();
        state.files.get(&token).cloned()
    }
}

#[async_trait]
impl DriveBackend for MockDrive {
    async fn list_root(&self, _tenant: &Tenant) -> EngineResult<RootListing> {
        let state = self.state.lock().unwrap();
        Ok(RootListing {
            root_token: ROOT.into(),
            entries: state.folders.get(ROOT).cloned().unwrap_or_default(),
        })
    }

    async fn list_folder(
        &self,
        _tenant: &Tenant,
        folder_token: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.folders.get(folder_token).cloned().unwrap_or_default())
    }

    async fn metadata(&self, _tenant: &Tenant, token: &str) -> EngineResult<EntryMetadata> {
        let state = self.state.lock().unwrap();
        let bytes = state
            .files
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
        let token = format!("fld_{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.folders.entry(parent_token.to_string()).or_default().push(RemoteEntry {
            token: token.clone(),
            name: name.to_string(),
            kind: EntryKind::Folder,
            parent_token: Some(parent_token.to_string()),
            size: None,
            mtime: None,
        });
        state.folders.insert(token.clone(), Vec::new());
        Ok(token)
    }

    async fn move_entry(&self, _t: &Tenant, _token: &str, _p: &str) -> EngineResult<()> {
        Err(EngineError::UpstreamPermanent("not in test scope".into()))
    }

    async fn copy_entry(
        &self,
        _t: &Tenant,
        _token: &str,
        _p: &str,
        _n: &str,
    ) -> EngineResult<String> {
        Err(EngineError::UpstreamPermanent("not in test scope".into()))
    }

    async fn rename_entry(&self, _t: &Tenant, _token: &str, _n: &str) -> EngineResult<()> {
        Err(EngineError::UpstreamPermanent("not in test scope".into()))
    }

    async fn delete_entry(&self, _t: &Tenant, token: &str, _k: EntryKind) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.files.remove(token);
        for entries in state.folders.values_mut() {
            entries.retain(|e| e.token != token);
        }
        state.folders.remove(token);
        Ok(())
    }

    async fn upload_init(
        &self,
        _tenant: &Tenant,
        parent_token: &str,
        file_name: &str,
        _size: u64,
    ) -> EngineResult<UploadSession> {
        let upload_id = format!("up_{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(
            upload_id.clone(),
            (parent_token.to_string(), file_name.to_string(), BTreeMap::new()),
        );
        Ok(UploadSession {
            upload_id,
            block_size: 1_048_576,
        })
    }

    async fn upload_block(
        &self,
        _tenant: &Tenant,
        upload_id: &str,
        seq: u64,
        bytes: Vec<u8>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::UpstreamPermanent("unknown upload".into()))?;
        session.2.insert(seq, bytes);
        Ok(())
    }

    async fn upload_finish(
        &self,
        _tenant: &Tenant,
        upload_id: &str,
        _block_count: u64,
    ) -> EngineResult<String> {
        let mut state = self.state.lock().unwrap();
        let (parent, name, blocks) = state
            .sessions
            .remove(upload_id)
            .ok_or_else(|| EngineError::UpstreamPermanent("unknown upload".into()))?;
        let mut assembled = Vec::new();
        for (_, block) in blocks {
            assembled.extend_from_slice(&block);
        }
        let token = format!("tok_{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        // Replace a previous entry with the same name (overwrite upload).
        if let Some(entries) = state.folders.get_mut(&parent) {
            entries.retain(|e| e.name != name);
        }
        state.folders.entry(parent.clone()).or_default().push(RemoteEntry {
            token: token.clone(),
            name,
            kind: EntryKind::File,
            parent_token: Some(parent),
            size: Some(assembled.len() as u64),
            mtime: Some(self.server_mtime),
        });
        state.files.insert(token.clone(), assembled);
        Ok(token)
    }

    async fn upload_abort(&self, _tenant: &Tenant, upload_id: &str) -> EngineResult<()> {
        self.state.lock().unwrap().sessions.remove(upload_id);
        Ok(())
    }

    async fn download_range(
        &self,
        _tenant: &Tenant,
        token: &str,
        offset: u64,
        len: u64,
    ) -> EngineResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let bytes = state
            .files
            .get(token)
            .ok_or_else(|| EngineError::NotFound(format!("token {token}")))?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + len as usize).min(bytes.len());
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
    runner: Arc<SyncRunner>,
    tenant: Tenant,
    local_root: tempfile::TempDir,
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
                display_name: "sync-tenant".into(),
                app_id: "app".into(),
                app_secret: "secret".into(),
                platform: Platform::Intl,
                quota_bytes: 10 * 1024 * 1024 * 1024,
                permission: TenantPermission::ReadWrite,
            })
            .await
            .unwrap();
        store.resources.register(ROOT, tenant.id).await.unwrap();

        let config = TransferConfig {
            retry_base_ms: 1,
            retry_cap_ms: 2,
            ..TransferConfig::default()
        };
        let engine = TransferEngine::new(Arc::clone(&store), Arc::clone(&registry), config);
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
        let runner = SyncRunner::new(
            Arc::clone(&store),
            registry,
            engine,
            shutdown.clone(),
        );
        Self {
            store,
            drive,
            runner,
            tenant,
            local_root: tempfile::tempdir().unwrap(),
            shutdown,
            _dir: dir,
        }
    }

    fn task(&self, direction: SyncDirection, conflict: ConflictPolicy, propagate: bool) -> SyncTask {
        let now = Utc::now();
        SyncTask {
            id: TaskId::new(),
            name: "test-sync".into(),
            direction,
            group_id: GroupId::new(),
            tenant_id: self.tenant.id,
            remote_folder_token: ROOT.into(),
            local_path: self.local_root.path().to_string_lossy().into_owned(),
            schedule: "*/5 * * * *".into(),
            enabled: true,
            detection: DetectionMode::SizeMtime,
            conflict,
            propagate_delete: propagate,
            include_globs: vec![],
            exclude_globs: vec![],
            notes: None,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_run_at: None,
            last_status: TaskStatus::Idle,
            last_message: None,
            consecutive_failures: 0,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::hours(6)
}

fn write_with_mtime(path: &Path, bytes: &[u8], mtime: DateTime<Utc>) {
    std::fs::write(path, bytes).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::from(mtime)).unwrap();
}

#[tokio::test]
async fn test_bidirectional_conflict_newest_downloads_remote() {
    // Snapshot x.txt {size 10, mtime T}; remote {12, T+30}; local {11,
    // T+10}. One download replaces local; no upload; snapshot records the
    // remote side's size and mtime.
    let t = base_time();
    let drive = MockDrive::new(Utc::now());
    let remote_mtime = t + Duration::seconds(30);
    drive.seed_file(ROOT, "x.txt", b"rrrrrrrrrrrr".to_vec(), remote_mtime);

    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::Bidirectional, ConflictPolicy::Newest, false);
    let task_id = task.id;
    h.store.tasks.insert(task.clone()).await.unwrap();

    write_with_mtime(
        &h.local_root.path().join("x.txt"),
        b"lllllllllll",
        t + Duration::seconds(10),
    );
    let mut snap = SyncSnapshot::default();
    snap.entries.insert(
        "x.txt".into(),
        SnapshotEntry {
            size: 10,
            mtime: Some(t),
            remote_token: None,
            checksum: None,
        },
    );
    h.store.snapshots.save(&task_id, &snap).await.unwrap();

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);

    // Local content replaced by the 12-byte remote version.
    let local = tokio::fs::read(h.local_root.path().join("x.txt")).await.unwrap();
    assert_eq!(local, b"rrrrrrrrrrrr");

    // No upload happened: the remote still holds the same content.
    assert_eq!(
        h.drive.content_by_name(ROOT, "x.txt").unwrap(),
        b"rrrrrrrrrrrr"
    );

    // Snapshot carries the winning side's metadata.
    let committed = h.store.snapshots.load(&task_id).await.unwrap();
    let entry = committed.get("x.txt").expect("snapshot entry");
    assert_eq!(entry.size, 12);
    assert_eq!(entry.mtime.unwrap().timestamp(), remote_mtime.timestamp());
}

#[tokio::test]
async fn test_delete_propagation_removes_remote_file() {
    // Snapshot {a, b}; remote {a, b}; local {a}: b is deleted remotely
    // and leaves the snapshot.
    let t = base_time();
    let drive = MockDrive::new(Utc::now());
    drive.seed_file(ROOT, "a", b"aa".to_vec(), t);
    drive.seed_file(ROOT, "b", b"bb".to_vec(), t);

    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::Bidirectional, ConflictPolicy::Newest, true);
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();

    write_with_mtime(&h.local_root.path().join("a"), b"aa", t);
    let mut snap = SyncSnapshot::default();
    for name in ["a", "b"] {
        snap.entries.insert(
            name.into(),
            SnapshotEntry {
                size: 2,
                mtime: Some(t),
                remote_token: None,
                checksum: None,
            },
        );
    }
    h.store.snapshots.save(&task_id, &snap).await.unwrap();

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);

    assert_eq!(h.drive.file_names(ROOT), vec!["a".to_string()]);
    let committed = h.store.snapshots.load(&task_id).await.unwrap();
    assert!(committed.get("a").is_some());
    assert!(committed.get("b").is_none());
}

#[tokio::test]
async fn test_first_run_copies_both_ways_without_deleting() {
    let t = base_time();
    let drive = MockDrive::new(Utc::now());
    drive.seed_file(ROOT, "remote_only.txt", b"from-cloud".to_vec(), t);

    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::Bidirectional, ConflictPolicy::Newest, true);
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();
    write_with_mtime(&h.local_root.path().join("local_only.txt"), b"from-disk", t);

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);

    // Both sides gained the other's file; nothing was deleted.
    let local = tokio::fs::read(h.local_root.path().join("remote_only.txt"))
        .await
        .unwrap();
    assert_eq!(local, b"from-cloud");
    assert_eq!(
        h.drive.content_by_name(ROOT, "local_only.txt").unwrap(),
        b"from-disk"
    );

    let committed = h.store.snapshots.load(&task_id).await.unwrap();
    assert_eq!(committed.entries.len(), 2);
}

#[tokio::test]
async fn test_second_run_with_no_changes_is_noop() {
    let t = base_time();
    let drive = MockDrive::new(t + Duration::minutes(1));
    drive.seed_file(ROOT, "steady.txt", b"same".to_vec(), t);

    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::Bidirectional, ConflictPolicy::Newest, true);
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();
    write_with_mtime(&h.local_root.path().join("only_here.txt"), b"mine", t);

    h.runner.trigger(&task_id).await.unwrap();
    let transfers_after_first = h.store.transfers.list().await.unwrap().len();

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);
    assert_eq!(
        finished.last_message.as_deref(),
        Some("both sides already in agreement")
    );
    // The second run performed zero transfers.
    let transfers_after_second = h.store.transfers.list().await.unwrap().len();
    assert_eq!(transfers_after_first, transfers_after_second);
}

#[tokio::test]
async fn test_cloud_to_local_ignores_local_extras() {
    let t = base_time();
    let drive = MockDrive::new(Utc::now());
    drive.seed_file(ROOT, "pull.txt", b"cloud".to_vec(), t);

    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::CloudToLocal, ConflictPolicy::Newest, false);
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();
    write_with_mtime(&h.local_root.path().join("keep_local.txt"), b"mine", t);

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);

    // Pulled the remote file, never pushed the local one.
    assert!(h.local_root.path().join("pull.txt").exists());
    assert_eq!(h.drive.file_names(ROOT), vec!["pull.txt".to_string()]);
}

#[tokio::test]
async fn test_nested_upload_creates_remote_folders() {
    let t = base_time();
    let drive = MockDrive::new(Utc::now());
    let h = Harness::new(drive).await;
    let task = h.task(SyncDirection::LocalToCloud, ConflictPolicy::Newest, false);
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();

    std::fs::create_dir_all(h.local_root.path().join("docs/deep")).unwrap();
    write_with_mtime(
        &h.local_root.path().join("docs/deep/report.txt"),
        b"nested",
        t,
    );

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Success);

    assert_eq!(h.drive.file_names(ROOT), vec!["docs".to_string()]);
    let committed = h.store.snapshots.load(&task_id).await.unwrap();
    let entry = committed.get("docs/deep/report.txt").expect("uploaded entry");
    assert!(entry.remote_token.is_some());
}

#[tokio::test]
async fn test_failed_run_keeps_snapshot_and_counts_failures() {
    // Remote folder token resolves to nothing listable after seeding a
    // task whose tenant was removed mid-flight; simulate by pointing the
    // task at a tenant that no longer exists.
    let drive = MockDrive::new(Utc::now());
    let h = Harness::new(drive).await;
    let mut task = h.task(SyncDirection::Bidirectional, ConflictPolicy::Newest, true);
    task.tenant_id = muxdrive_core::domain::TenantId::new();
    let task_id = task.id;
    h.store.tasks.insert(task).await.unwrap();

    let finished = h.runner.trigger(&task_id).await.unwrap();
    assert_eq!(finished.last_status, TaskStatus::Failed);
    assert_eq!(finished.consecutive_failures, 1);
    assert!(h.store.snapshots.load(&task_id).await.unwrap().is_empty());
}
