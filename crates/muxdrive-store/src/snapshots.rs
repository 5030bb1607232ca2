//! Per-task snapshot documents (`snapshots/<task_id>.json`)

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use muxdrive_core::domain::{SyncSnapshot, TaskId};
use muxdrive_core::{EngineError, EngineResult};

/// Stores one snapshot file per sync task.
///
/// Snapshot files are small and rewritten whole; a per-task mutex keeps
/// concurrent save/delete for the same task serialized.
pub struct SnapshotStore {
    dir: PathBuf,
    locks: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, task_id: &TaskId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Loads the snapshot, or an empty one if none has been committed yet.
    pub async fn load(&self, task_id: &TaskId) -> EngineResult<SyncSnapshot> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;
        match tokio::fs::read(self.path_for(task_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::PersistenceCorrupt(format!("snapshot for task {task_id}: {e}"))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(SyncSnapshot::default())
            }
            Err(err) => Err(EngineError::LocalIo(err.to_string())),
        }
    }

    /// Persists the snapshot atomically (temp file + rename).
    pub async fn save(&self, task_id: &TaskId, snapshot: &SyncSnapshot) -> EngineResult<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(task_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Deletes the snapshot file, ignoring a missing file.
    pub async fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.path_for(task_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::LocalIo(err.to_string())),
        }
    }
}
