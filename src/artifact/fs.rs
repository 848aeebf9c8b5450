// src/artifact/fs.rs

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{DatamillError, Result};
use crate::types::BoxFuture;

use super::{ArtifactRef, ArtifactStore};

/// Artifact store backed by a directory: one file per artifact id.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let safe = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if safe {
            Ok(self.root.join(id))
        } else {
            Err(missing(id))
        }
    }
}

fn missing(id: &str) -> DatamillError {
    DatamillError::NotFound {
        kind: "artifact",
        id: id.to_string(),
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> DatamillError {
    DatamillError::StorageUnavailable(format!("{}: {err}", path.display()))
}

fn map_io(id: &str, path: &Path, err: std::io::Error) -> DatamillError {
    if err.kind() == std::io::ErrorKind::NotFound {
        missing(id)
    } else {
        unavailable(path, err)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put<'a>(&'a self, id: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<ArtifactRef>> {
        Box::pin(async move {
            let path = self.path_for(id)?;
            let receipt = ArtifactRef::for_bytes(id, &bytes);
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| unavailable(&path, e))?;
            debug!(path = %path.display(), size = receipt.size, "artifact written");
            Ok(receipt)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let path = self.path_for(id)?;
            tokio::fs::read(&path).await.map_err(|e| map_io(id, &path, e))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(id)?;
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| map_io(id, &path, e))
        })
    }
}
