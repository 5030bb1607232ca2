//! Single-file JSON document with atomic persistence
//!
//! [`JsonDocument`] keeps the parsed value in memory behind a `RwLock` and
//! rewrites the whole file on every mutation: serialize to `<name>.tmp`,
//! then rename over the original. A missing file yields the type's
//! `Default`; a file that exists but does not parse poisons the document.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, warn};

use muxdrive_core::{EngineError, EngineResult};

enum DocState<T> {
    Loaded(T),
    /// Parse failure at open time. The original bytes are left untouched
    /// on disk; every access reports the stored reason.
    Poisoned(String),
}

/// One on-disk JSON document.
pub struct JsonDocument<T> {
    path: PathBuf,
    state: RwLock<DocState<T>>,
}

impl<T> JsonDocument<T>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    /// Opens (and parses) the document at `path`.
    ///
    /// Opening never fails outright: a corrupt file is quarantined so the
    /// rest of the engine can keep serving the documents that are intact.
    pub async fn open(path: PathBuf) -> EngineResult<Self> {
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => DocState::Loaded(value),
                Err(err) => {
                    error!(
                        path = %path.display(),
                        error = %err,
                        "Document failed to parse, refusing mutations until repaired"
                    );
                    DocState::Poisoned(format!("{}: {err}", path.display()))
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                DocState::Loaded(T::default())
            }
            Err(err) => return Err(EngineError::LocalIo(err.to_string())),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Returns a clone of the current value.
    pub async fn read(&self) -> EngineResult<T> {
        match &*self.state.read().await {
            DocState::Loaded(value) => Ok(value.clone()),
            DocState::Poisoned(reason) => Err(EngineError::PersistenceCorrupt(reason.clone())),
        }
    }

    /// Applies `f` under the read lock without cloning the whole value.
    pub async fn with<R>(&self, f: impl FnOnce(&T) -> R) -> EngineResult<R> {
        match &*self.state.read().await {
            DocState::Loaded(value) => Ok(f(value)),
            DocState::Poisoned(reason) => Err(EngineError::PersistenceCorrupt(reason.clone())),
        }
    }

    /// Mutates the value and persists it atomically.
    ///
    /// The mutation is applied in memory first; if the disk write fails the
    /// in-memory value is still updated and the error is returned, so the
    /// caller decides whether to retry or surface it.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> EngineResult<R> {
        let mut guard = self.state.write().await;
        match &mut *guard {
            DocState::Loaded(value) => {
                let result = f(value);
                self.persist(value).await?;
                Ok(result)
            }
            DocState::Poisoned(reason) => Err(EngineError::PersistenceCorrupt(reason.clone())),
        }
    }

    /// Like [`update`](Self::update) but the closure may fail; the document
    /// is persisted only when it returns `Ok`.
    pub async fn try_update<R>(
        &self,
        f: impl FnOnce(&mut T) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut guard = self.state.write().await;
        match &mut *guard {
            DocState::Loaded(value) => {
                let mut draft = value.clone();
                let result = f(&mut draft)?;
                *value = draft;
                self.persist(value).await?;
                Ok(result)
            }
            DocState::Poisoned(reason) => Err(EngineError::PersistenceCorrupt(reason.clone())),
        }
    }

    async fn persist(&self, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %err, "Atomic rename failed");
            return Err(EngineError::LocalIo(err.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        items: Vec<String>,
    }

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let doc: JsonDocument<Doc> = JsonDocument::open(dir.path().join("d.json")).await.unwrap();
        assert_eq!(doc.read().await.unwrap(), Doc::default());
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.json");

        let doc: JsonDocument<Doc> = JsonDocument::open(path.clone()).await.unwrap();
        doc.update(|d| d.items.push("one".into())).await.unwrap();
        doc.update(|d| d.items.push("two".into())).await.unwrap();

        let reopened: JsonDocument<Doc> = JsonDocument::open(path).await.unwrap();
        assert_eq!(
            reopened.read().await.unwrap().items,
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let doc: JsonDocument<Doc> = JsonDocument::open(path.clone()).await.unwrap();
        assert!(matches!(
            doc.read().await,
            Err(muxdrive_core::EngineError::PersistenceCorrupt(_))
        ));
        assert!(matches!(
            doc.update(|d| d.items.push("x".into())).await,
            Err(muxdrive_core::EngineError::PersistenceCorrupt(_))
        ));

        // Original bytes are preserved for the operator.
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes, b"{ not json");
    }

    #[tokio::test]
    async fn test_try_update_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let doc: JsonDocument<Doc> = JsonDocument::open(dir.path().join("d.json")).await.unwrap();

        let result: EngineResult<()> = doc
            .try_update(|d| {
                d.items.push("doomed".into());
                Err(muxdrive_core::EngineError::Conflict("no".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(doc.read().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.json");
        let doc: JsonDocument<Doc> = JsonDocument::open(path.clone()).await.unwrap();
        doc.update(|d| d.items.push("x".into())).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
