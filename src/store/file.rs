// src/store/file.rs

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{DatamillError, Result};
use crate::run::Run;
use crate::types::BoxFuture;

use super::{DocumentStore, Versioned};

/// Durable document store keeping one JSON file per run under
/// `<root>/runs/<id>.json`.
///
/// The conditional write is a read-compare-rename under a store-wide lock,
/// so a single process sharing one `FileDocumentStore` gets the same
/// revision semantics as a real document database.
#[derive(Debug)]
pub struct FileDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDocumentStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("runs"))
            .await
            .map_err(|e| unavailable(&root, e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn doc_path(&self, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        safe.then(|| self.root.join("runs").join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<Versioned>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(path, e)),
        }
    }
}

impl DocumentStore for FileDocumentStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Versioned>>> {
        Box::pin(async move {
            match self.doc_path(id) {
                Some(path) => self.read(&path).await,
                None => Ok(None),
            }
        })
    }

    fn put(&self, run: Run, expected: Option<u64>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let path = self.doc_path(&run.id).ok_or_else(|| {
                DatamillError::InvalidState(format!("run id '{}' is not a valid document key", run.id))
            })?;

            let _guard = self.write_lock.lock().await;

            let current = self.read(&path).await?.map(|v| v.revision);
            if current != expected {
                return Err(DatamillError::Conflict(run.id));
            }

            let revision = current.map_or(1, |r| r + 1);
            let bytes = serde_json::to_vec_pretty(&Versioned { revision, run })?;

            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &bytes)
                .await
                .map_err(|e| unavailable(&tmp, e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| unavailable(&path, e))?;

            debug!(path = %path.display(), revision, "wrote run document");
            Ok(revision)
        })
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> DatamillError {
    DatamillError::StorageUnavailable(format!("{}: {err}", path.display()))
}
