//! Sync snapshots
//!
//! The snapshot is the third leg of the three-way diff: the last known
//! synchronized state of a task, keyed by relative path. It is committed
//! only after a fully successful run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-known-good state of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_token: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Per-task snapshot document (`snapshots/<task_id>.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSnapshot {
    #[serde(default)]
    pub entries: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.captured_at.is_none()
    }

    pub fn get(&self, rel_path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(rel_path)
    }

    /// Replaces the snapshot content and stamps the capture time.
    pub fn replace(&mut self, entries: BTreeMap<String, SnapshotEntry>) {
        self.entries = entries;
        self.captured_at = Some(Utc::now());
    }
}
