//! Append-only audit log
//!
//! One active `api.jsonl` file plus timestamped archives in the log
//! directory. When the active file exceeds the size cap it rolls over;
//! archives are pruned oldest-first to keep the directory under the cap.
//! Appending is non-fatal by design: an audit write failure is logged and
//! never breaks the dispatch that produced it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use muxdrive_core::domain::{ApiLogEntry, ApiLogStatus};
use muxdrive_core::{EngineError, EngineResult};

const ACTIVE_FILE: &str = "api.jsonl";
const ARCHIVE_PREFIX: &str = "api-";

/// Filter for [`AuditLog::query`].
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Case-sensitive substring over the command name.
    pub command_contains: Option<String>,
    pub status: Option<ApiLogStatus>,
    /// Maximum entries returned, newest first.
    pub limit: usize,
}

/// Rolling on-disk audit log.
pub struct AuditLog {
    dir: PathBuf,
    max_bytes: AtomicU64,
    // Serializes append/rollover; queries read a consistent directory.
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// `max_size_mb` is expected to be pre-clamped to the 5-2048 range by
    /// the configuration layer.
    pub fn new(dir: PathBuf, max_size_mb: u64) -> Self {
        Self {
            dir,
            max_bytes: AtomicU64::new(max_size_mb * 1024 * 1024),
            write_lock: Mutex::new(()),
        }
    }

    /// Applies a new size cap; takes effect on the next append.
    pub fn set_max_size_mb(&self, max_size_mb: u64) {
        self.max_bytes
            .store(max_size_mb * 1024 * 1024, Ordering::Relaxed);
    }

    fn cap_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    /// Appends an entry, rolling the active file over when it is full.
    /// Failures are swallowed with a warning.
    pub async fn append(&self, entry: &ApiLogEntry) {
        if let Err(err) = self.try_append(entry).await {
            warn!(error = %err, "Failed to append audit log entry");
        }
    }

    async fn try_append(&self, entry: &ApiLogEntry) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let line = serde_json::to_string(entry)
            .map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))?;

        let active = self.dir.join(ACTIVE_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        drop(file);

        self.rollover_if_needed().await
    }

    async fn rollover_if_needed(&self) -> EngineResult<()> {
        let active = self.dir.join(ACTIVE_FILE);
        let size = match tokio::fs::metadata(&active).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.cap_bytes() {
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let archive = self.dir.join(format!("{ARCHIVE_PREFIX}{stamp}.jsonl"));
        tokio::fs::rename(&active, &archive).await?;

        // Prune oldest archives until the directory fits the cap again.
        let mut archives = self.archive_paths().await?;
        let mut total: u64 = 0;
        for path in &archives {
            total += tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        }
        archives.sort(); // timestamp names sort chronologically
        // The newest archive is always kept so a roll never erases the
        // entries that caused it.
        let prunable = archives.len().saturating_sub(1);
        let mut index = 0;
        while total > self.cap_bytes() && index < prunable {
            let oldest = &archives[index];
            let len = tokio::fs::metadata(oldest).await.map(|m| m.len()).unwrap_or(0);
            if let Err(err) = tokio::fs::remove_file(oldest).await {
                warn!(path = %oldest.display(), error = %err, "Failed to prune audit archive");
                break;
            }
            total = total.saturating_sub(len);
            index += 1;
        }
        Ok(())
    }

    async fn archive_paths(&self) -> EngineResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".jsonl") {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    /// Filtered read over the active file and archives, newest first.
    pub async fn query(&self, filter: &LogQuery) -> EngineResult<Vec<ApiLogEntry>> {
        let _guard = self.write_lock.lock().await;
        let limit = if filter.limit == 0 { 100 } else { filter.limit };

        let mut files = self.archive_paths().await.unwrap_or_default();
        files.sort();
        files.push(self.dir.join(ACTIVE_FILE));

        let mut matched: Vec<ApiLogEntry> = Vec::new();
        // Newest file last; read back-to-front so the newest entries win.
        for path in files.iter().rev() {
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            for line in content.lines().rev() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: ApiLogEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(error = %err, "Skipping unparseable audit line");
                        continue;
                    }
                };
                if let Some(needle) = &filter.command_contains {
                    if !entry.command.contains(needle.as_str()) {
                        continue;
                    }
                }
                if let Some(status) = filter.status {
                    if entry.status != status {
                        continue;
                    }
                }
                matched.push(entry);
                if matched.len() >= limit {
                    return Ok(matched);
                }
            }
        }
        Ok(matched)
    }
}
