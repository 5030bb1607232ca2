//! Scheduled sync tasks
//!
//! A sync task pairs one remote folder with one local directory and
//! reconciles them on a cron schedule. While `last_status` is `Running`
//! the scheduler never re-enters the task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, TaskId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    CloudToLocal,
    LocalToCloud,
    Bidirectional,
}

/// How the runner decides whether an entry changed since the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// mtime or remote token differs from the snapshot.
    Metadata,
    /// size differs, or mtime differs by more than 2 seconds.
    #[default]
    SizeMtime,
    /// size_mtime plus an Adler-32 over local content.
    Checksum,
}

/// How a both-sides-changed conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Larger mtime wins; ties go to the remote side.
    #[default]
    Newest,
    PreferLocal,
    PreferRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Scheduled,
    Running,
    Success,
    Failed,
}

/// One scheduled folder-synchronization task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    pub name: String,
    pub direction: SyncDirection,
    pub group_id: GroupId,
    pub tenant_id: TenantId,
    pub remote_folder_token: String,
    pub local_path: String,
    /// 5-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    #[serde(default)]
    pub detection: DetectionMode,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    #[serde(default = "default_true")]
    pub propagate_delete: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: TaskStatus,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}

impl SyncTask {
    pub fn is_running(&self) -> bool {
        matches!(self.last_status, TaskStatus::Running)
    }

    /// Whether the ticker should dispatch the task at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.is_running()
            && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// One line of a sync run's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl SyncLogEntry {
    pub fn info(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::at_level(task_id, "info", message)
    }

    pub fn warn(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::at_level(task_id, "warn", message)
    }

    pub fn error(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::at_level(task_id, "error", message)
    }

    fn at_level(task_id: TaskId, level: &str, message: impl Into<String>) -> Self {
        Self {
            task_id,
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        }
    }
}
