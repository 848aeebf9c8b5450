// src/artifact/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{DatamillError, Result};
use crate::types::BoxFuture;

use super::{ArtifactRef, ArtifactStore};

/// Artifact store that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_blobs<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> Result<T>) -> Result<T> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| DatamillError::StorageUnavailable("artifact map poisoned".to_string()))?;
        f(&mut blobs)
    }
}

fn missing(id: &str) -> DatamillError {
    DatamillError::NotFound {
        kind: "artifact",
        id: id.to_string(),
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put<'a>(&'a self, id: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<ArtifactRef>> {
        Box::pin(async move {
            let receipt = ArtifactRef::for_bytes(id, &bytes);
            self.with_blobs(|blobs| {
                blobs.insert(id.to_string(), bytes);
                Ok(receipt)
            })
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.with_blobs(|blobs| blobs.get(id).cloned().ok_or_else(|| missing(id))) })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.with_blobs(|blobs| blobs.remove(id).map(|_| ()).ok_or_else(|| missing(id)))
        })
    }
}
