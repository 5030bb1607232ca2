//! Transfer records
//!
//! A transfer is a durable upload or download. The record is persisted on
//! every mutation; [`ResumePayload`] carries the last durable checkpoint so
//! a partially completed transfer can continue after a process restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, TenantId, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    FileUpload,
    FolderUpload,
    FileDownload,
    FolderDownload,
}

impl TransferKind {
    pub fn direction(&self) -> TransferDirection {
        match self {
            TransferKind::FileUpload | TransferKind::FolderUpload => TransferDirection::Upload,
            TransferKind::FileDownload | TransferKind::FolderDownload => {
                TransferDirection::Download
            }
        }
    }
}

/// Transfer lifecycle. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::Failed)
    }
}

/// Durable checkpoint for a partially completed transfer.
///
/// Present iff the transfer has made partial progress and is recoverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResumePayload {
    UploadFile {
        upload_id: String,
        block_size: u64,
        /// Next block sequence number to send (blocks 0..next_seq are durable
        /// upstream).
        next_seq: u64,
        parent_token: String,
        file_path: String,
        file_name: String,
        size: u64,
    },
    DownloadFile {
        temp_path: String,
        target_path: String,
        /// Bytes already appended to the temp file.
        downloaded: u64,
        token: String,
        file_name: String,
    },
}

/// One durable transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub kind: TransferKind,
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub parent_token: Option<String>,
    #[serde(default)]
    pub resource_token: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub remote_path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub transferred: u64,
    pub status: TransferStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resume: Option<ResumePayload>,
    /// Set when the transfer was spawned by a sync run.
    #[serde(default)]
    pub sync_task_id: Option<TaskId>,
}

impl Transfer {
    /// Builds a fresh `pending` record.
    pub fn new(kind: TransferKind, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            direction: kind.direction(),
            kind,
            name,
            tenant_id: None,
            parent_token: None,
            resource_token: None,
            local_path: None,
            remote_path: None,
            size: 0,
            transferred: 0,
            status: TransferStatus::Pending,
            message: None,
            created_at: now,
            updated_at: now,
            resume: None,
            sync_task_id: None,
        }
    }

    /// A restart clone: same logical parameters, fresh id, pending status,
    /// zero progress.
    pub fn restarted(&self) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: TransferId::new(),
            transferred: 0,
            status: TransferStatus::Pending,
            message: None,
            created_at: now,
            updated_at: now,
            resume: None,
            ..self.clone()
        }
    }
}
