//! Local and remote tree enumeration

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};

use muxdrive_core::domain::Tenant;
use muxdrive_core::ports::{DriveBackend, EntryKind};
use muxdrive_core::{EngineError, EngineResult};

use crate::filter::PathFilter;

/// One remote file reachable from the task's remote folder.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub rel_path: String,
    pub token: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Remote enumeration result: files by relative path, plus every folder's
/// token keyed by its relative path (the empty key is the root).
#[derive(Debug, Clone, Default)]
pub struct RemoteTree {
    pub files: BTreeMap<String, RemoteFile>,
    pub dirs: BTreeMap<String, String>,
}

/// One local file under the task's local root.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub rel_path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Depth-first remote walk from `root_token`, applying the filter to
/// files. Folders are walked even when they fail the include filter so
/// their children are still considered.
pub async fn scan_remote(
    backend: &dyn DriveBackend,
    tenant: &Tenant,
    root_token: &str,
    filter: &PathFilter,
) -> EngineResult<RemoteTree> {
    let mut tree = RemoteTree::default();
    tree.dirs.insert(String::new(), root_token.to_string());

    let mut queue: VecDeque<(String, String)> = VecDeque::new();
    queue.push_back((root_token.to_string(), String::new()));

    while let Some((token, prefix)) = queue.pop_front() {
        let entries = backend.list_folder(tenant, &token).await?;
        let mut seen: HashSet<&str> = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(EngineError::PersistenceCorrupt(format!(
                    "folder {token} lists duplicate entry name '{}'",
                    entry.name
                )));
            }
        }
        for entry in entries {
            let rel = join_rel(&prefix, &entry.name);
            if entry.kind == EntryKind::Folder {
                tree.dirs.insert(rel.clone(), entry.token.clone());
                queue.push_back((entry.token, rel));
                continue;
            }
            if !filter.matches(&rel) {
                continue;
            }
            tree.files.insert(
                rel.clone(),
                RemoteFile {
                    rel_path: rel,
                    token: entry.token,
                    kind: entry.kind,
                    size: entry.size.unwrap_or(0),
                    mtime: entry.mtime,
                },
            );
        }
    }
    Ok(tree)
}

/// Recursive local walk yielding filtered files keyed by relative path.
pub async fn scan_local(
    root: &Path,
    filter: &PathFilter,
) -> EngineResult<BTreeMap<String, LocalFile>> {
    let mut files = BTreeMap::new();
    let mut pending: Vec<(std::path::PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = join_rel(&prefix, &name);
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), rel));
            } else if file_type.is_file() {
                if !filter.matches(&rel) {
                    continue;
                }
                let metadata = entry.metadata().await?;
                let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);
                files.insert(
                    rel.clone(),
                    LocalFile {
                        rel_path: rel,
                        size: metadata.len(),
                        mtime,
                    },
                );
            }
        }
    }
    Ok(files)
}

fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rel() {
        assert_eq!(join_rel("", "a.txt"), "a.txt");
        assert_eq!(join_rel("docs", "a.txt"), "docs/a.txt");
        assert_eq!(join_rel("a/b", "c"), "a/b/c");
    }

    #[tokio::test]
    async fn test_scan_local_walks_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
        tokio::fs::write(dir.path().join("top.txt"), b"1").await.unwrap();
        tokio::fs::write(dir.path().join("a/mid.txt"), b"22").await.unwrap();
        tokio::fs::write(dir.path().join("a/b/deep.txt"), b"333")
            .await
            .unwrap();

        let files = scan_local(dir.path(), &PathFilter::allow_all())
            .await
            .unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files["a/b/deep.txt"].size, 3);
        assert!(files["top.txt"].mtime.is_some());
    }

    #[tokio::test]
    async fn test_scan_local_applies_filter_to_files_not_dirs() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("skipdir")).await.unwrap();
        tokio::fs::write(dir.path().join("skipdir/keep.txt"), b"k")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("drop.log"), b"d").await.unwrap();

        // The directory name itself fails the include filter, but its
        // child still matches.
        let filter = PathFilter::new(&["**/*.txt".into()], &[]).unwrap();
        let files = scan_local(dir.path(), &filter).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("skipdir/keep.txt"));
    }
}
