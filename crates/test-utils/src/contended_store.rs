use std::sync::atomic::{AtomicUsize, Ordering};

use datamill::errors::{DatamillError, Result};
use datamill::run::Run;
use datamill::store::{DocumentStore, MemoryDocumentStore, Versioned};
use datamill::types::BoxFuture;

/// A document store that loses the first `n` conditional writes to an
/// imaginary concurrent writer, then behaves like `MemoryDocumentStore`.
///
/// Creation writes (no expected revision) are never contended.
pub struct ContendedStore {
    inner: MemoryDocumentStore,
    conflicts_left: AtomicUsize,
    conflicts_raised: AtomicUsize,
    writes: AtomicUsize,
}

impl ContendedStore {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            conflicts_left: AtomicUsize::new(conflicts),
            conflicts_raised: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Lose `n` more writes from now on.
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts_left.fetch_add(n, Ordering::SeqCst);
    }

    pub fn conflicts_raised(&self) -> usize {
        self.conflicts_raised.load(Ordering::SeqCst)
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryDocumentStore {
        &self.inner
    }
}

impl DocumentStore for ContendedStore {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Versioned>>> {
        self.inner.get(id)
    }

    fn put(&self, run: Run, expected: Option<u64>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            if expected.is_some()
                && self
                    .conflicts_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                self.conflicts_raised.fetch_add(1, Ordering::SeqCst);
                return Err(DatamillError::Conflict(run.id));
            }

            let revision = self.inner.put(run, expected).await?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(revision)
        })
    }
}
