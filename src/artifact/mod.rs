// src/artifact/mod.rs

//! Artifact byte storage.
//!
//! Artifact bytes live outside the run document, keyed by data-unit id.
//! [`ArtifactRegistrar`] is the single path by which bytes become a data
//! unit: store the bytes, then add the unit to the run's pool.

pub mod fs;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::lineage::DataUnit;
use crate::store::RunStore;
use crate::types::{BoxFuture, DataKindName};

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

/// Receipt for stored artifact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    /// blake3 hex digest of the stored bytes.
    pub digest: String,
    pub size: u64,
}

impl ArtifactRef {
    pub fn for_bytes(id: &str, bytes: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            digest: blake3::hash(bytes).to_hex().to_string(),
            size: bytes.len() as u64,
        }
    }
}

/// Blob storage for artifact bytes.
pub trait ArtifactStore: Send + Sync {
    fn put<'a>(&'a self, id: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<ArtifactRef>>;
    /// Fails with `NotFound` if nothing is stored under `id`.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
    /// Fails with `NotFound` if nothing is stored under `id`.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Turns artifact bytes into data units of a run.
#[derive(Clone)]
pub struct ArtifactRegistrar {
    store: RunStore,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ArtifactRegistrar {
    pub fn new(store: RunStore, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Store `bytes` and add them to `run_id`'s pool as a unit of
    /// `data_kind`, produced by `step_id` if given.
    ///
    /// If the pool update fails the stored bytes are released again.
    pub async fn register(
        &self,
        run_id: &str,
        data_kind: DataKindName,
        bytes: Vec<u8>,
        step_id: Option<&str>,
    ) -> Result<DataUnit> {
        let unit_id = Uuid::new_v4().to_string();
        let receipt = self.artifacts.put(&unit_id, bytes).await?;
        debug!(
            run_id,
            unit_id = %receipt.id,
            digest = %receipt.digest,
            size = receipt.size,
            "artifact stored"
        );

        match self
            .store
            .add_to_data_pool(run_id, unit_id.clone(), data_kind, step_id)
            .await
        {
            Ok(unit) => Ok(unit),
            Err(e) => {
                if let Err(cleanup) = self.artifacts.delete(&unit_id).await {
                    warn!(
                        run_id,
                        %unit_id,
                        error = %cleanup,
                        "failed to release artifact after rejected registration"
                    );
                }
                Err(e)
            }
        }
    }
}
