//! Three-way diff and action planning
//!
//! For every relative path present remotely, locally, or in the snapshot,
//! the planner derives presence and change flags and emits the action the
//! task's direction permits. Deletions can only arise from paths recorded
//! in the snapshot, so a first run (empty snapshot) never deletes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use muxdrive_core::domain::{
    ConflictPolicy, DetectionMode, SnapshotEntry, SyncDirection, SyncSnapshot,
};

use crate::scan::{LocalFile, RemoteFile};

/// One reconciliation step, keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Download(String),
    Upload(String),
    DeleteRemote(String),
    DeleteLocal(String),
    /// Both sides gone; the entry just leaves the snapshot.
    DropSnapshot(String),
}

/// Planned actions plus human-readable conflict notes.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<String>,
}

/// Counts per action type, for run summaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSummary {
    pub downloads: usize,
    pub uploads: usize,
    pub delete_remote: usize,
    pub delete_local: usize,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a, SyncAction::DropSnapshot(_)))
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut s = ChangeSummary::default();
        for action in &self.actions {
            match action {
                SyncAction::Download(_) => s.downloads += 1,
                SyncAction::Upload(_) => s.uploads += 1,
                SyncAction::DeleteRemote(_) => s.delete_remote += 1,
                SyncAction::DeleteLocal(_) => s.delete_local += 1,
                SyncAction::DropSnapshot(_) => {}
            }
        }
        s
    }
}

/// Which side a conflict resolution picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Winner {
    Local,
    Remote,
}

/// Computes the action plan for one run.
pub fn plan(
    direction: SyncDirection,
    detection: DetectionMode,
    conflict: ConflictPolicy,
    propagate_delete: bool,
    remote: &BTreeMap<String, RemoteFile>,
    local: &BTreeMap<String, LocalFile>,
    snapshot: &SyncSnapshot,
    local_checksums: &BTreeMap<String, String>,
) -> SyncPlan {
    let mut paths: BTreeSet<&str> = BTreeSet::new();
    paths.extend(remote.keys().map(String::as_str));
    paths.extend(local.keys().map(String::as_str));
    paths.extend(snapshot.entries.keys().map(String::as_str));

    let mut out = SyncPlan::default();
    for path in paths {
        let r = remote.get(path);
        let l = local.get(path);
        let s = snapshot.get(path);
        match (r, l, s) {
            (None, None, None) => {}
            (None, None, Some(_)) => {
                out.actions.push(SyncAction::DropSnapshot(path.to_string()));
            }
            (Some(_), None, None) => {
                if allows_download(direction) {
                    out.actions.push(SyncAction::Download(path.to_string()));
                }
            }
            (None, Some(_), None) => {
                if allows_upload(direction) {
                    out.actions.push(SyncAction::Upload(path.to_string()));
                }
            }
            (Some(remote_file), Some(local_file), None) => {
                // Unseen on both sides: a conflict with no baseline.
                let winner = resolve(conflict, local_file.mtime, remote_file.mtime);
                out.conflicts.push(format!(
                    "{path}: present on both sides with no baseline, keeping {}",
                    side_name(winner)
                ));
                push_winner(&mut out.actions, direction, winner, path);
            }
            (Some(_), None, Some(_)) => {
                // Local copy deleted since the last run.
                if propagate_delete && allows_delete_remote(direction) {
                    out.actions.push(SyncAction::DeleteRemote(path.to_string()));
                } else if allows_download(direction) {
                    out.actions.push(SyncAction::Download(path.to_string()));
                }
            }
            (None, Some(_), Some(_)) => {
                // Remote copy deleted since the last run.
                if propagate_delete && allows_delete_local(direction) {
                    out.actions.push(SyncAction::DeleteLocal(path.to_string()));
                } else if allows_upload(direction) {
                    out.actions.push(SyncAction::Upload(path.to_string()));
                }
            }
            (Some(remote_file), Some(local_file), Some(snap)) => {
                let r_changed = remote_changed(detection, remote_file, snap);
                let l_changed =
                    local_changed(detection, local_file, snap, local_checksums.get(path));
                match (r_changed, l_changed) {
                    (false, false) => {}
                    (true, false) => {
                        if allows_download(direction) {
                            out.actions.push(SyncAction::Download(path.to_string()));
                        }
                    }
                    (false, true) => {
                        if allows_upload(direction) {
                            out.actions.push(SyncAction::Upload(path.to_string()));
                        }
                    }
                    (true, true) => {
                        let winner = resolve(conflict, local_file.mtime, remote_file.mtime);
                        out.conflicts.push(format!(
                            "{path}: changed on both sides, keeping {}",
                            side_name(winner)
                        ));
                        push_winner(&mut out.actions, direction, winner, path);
                    }
                }
            }
        }
    }
    out
}

fn allows_download(direction: SyncDirection) -> bool {
    direction != SyncDirection::LocalToCloud
}

fn allows_upload(direction: SyncDirection) -> bool {
    direction != SyncDirection::CloudToLocal
}

fn allows_delete_remote(direction: SyncDirection) -> bool {
    direction != SyncDirection::CloudToLocal
}

fn allows_delete_local(direction: SyncDirection) -> bool {
    direction != SyncDirection::LocalToCloud
}

fn push_winner(actions: &mut Vec<SyncAction>, direction: SyncDirection, winner: Winner, path: &str) {
    match winner {
        Winner::Local => {
            if allows_upload(direction) {
                actions.push(SyncAction::Upload(path.to_string()));
            }
        }
        Winner::Remote => {
            if allows_download(direction) {
                actions.push(SyncAction::Download(path.to_string()));
            }
        }
    }
}

fn side_name(winner: Winner) -> &'static str {
    match winner {
        Winner::Local => "local",
        Winner::Remote => "remote",
    }
}

/// Resolves a both-sides conflict. `newest` compares mtimes with ties
/// (and unknowns) going to the remote side.
fn resolve(
    policy: ConflictPolicy,
    local_mtime: Option<DateTime<Utc>>,
    remote_mtime: Option<DateTime<Utc>>,
) -> Winner {
    match policy {
        ConflictPolicy::PreferLocal => Winner::Local,
        ConflictPolicy::PreferRemote => Winner::Remote,
        ConflictPolicy::Newest => match (local_mtime, remote_mtime) {
            (Some(l), Some(r)) if l > r => Winner::Local,
            (Some(_), None) => Winner::Local,
            _ => Winner::Remote,
        },
    }
}

/// Equal to the second. Missing values compare equal only to missing.
fn mtime_equal(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.timestamp() == b.timestamp(),
        (None, None) => true,
        _ => false,
    }
}

/// Within the 2-second modification window. Unknown mtimes never count
/// as a change on their own.
fn mtime_close(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs() <= 2,
        _ => true,
    }
}

fn remote_changed(detection: DetectionMode, current: &RemoteFile, snap: &SnapshotEntry) -> bool {
    match detection {
        DetectionMode::Metadata => {
            snap.remote_token.as_deref() != Some(current.token.as_str())
                || !mtime_equal(current.mtime, snap.mtime)
        }
        DetectionMode::SizeMtime | DetectionMode::Checksum => {
            current.size != snap.size || !mtime_close(current.mtime, snap.mtime)
        }
    }
}

fn local_changed(
    detection: DetectionMode,
    current: &LocalFile,
    snap: &SnapshotEntry,
    checksum: Option<&String>,
) -> bool {
    match detection {
        DetectionMode::Metadata => !mtime_equal(current.mtime, snap.mtime),
        DetectionMode::SizeMtime => {
            current.size != snap.size || !mtime_close(current.mtime, snap.mtime)
        }
        DetectionMode::Checksum => {
            if current.size != snap.size || !mtime_close(current.mtime, snap.mtime) {
                return true;
            }
            match (checksum, &snap.checksum) {
                (Some(current_sum), Some(snap_sum)) => current_sum != snap_sum,
                _ => false,
            }
        }
    }
}
