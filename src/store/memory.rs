// src/store/memory.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{DatamillError, Result};
use crate::run::Run;
use crate::types::BoxFuture;

use super::{DocumentStore, Versioned};

/// In-process document store. Each document carries a revision counter that
/// is bumped on every successful write.
#[derive(Debug, Clone)]
pub struct MemoryDocumentStore {
    docs: Arc<Mutex<HashMap<String, Versioned>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            docs: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the backing medium going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DatamillError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Versioned>>> {
        self.docs
            .lock()
            .map_err(|_| DatamillError::StorageUnavailable("document map poisoned".to_string()))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Versioned>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.lock()?.get(id).cloned())
        })
    }

    fn put(&self, run: Run, expected: Option<u64>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check_available()?;
            let mut docs = self.lock()?;
            let current = docs.get(&run.id).map(|v| v.revision);
            if current != expected {
                return Err(DatamillError::Conflict(run.id));
            }

            let revision = current.map_or(1, |r| r + 1);
            docs.insert(run.id.clone(), Versioned { revision, run });
            Ok(revision)
        })
    }
}
