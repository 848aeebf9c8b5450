// src/exec/backend.rs

//! Pluggable job-execution backend abstraction.
//!
//! The dispatcher talks to a `JobBackend` instead of a concrete cluster API.
//! This makes it easy to swap in a fake backend in tests while keeping a
//! real implementation ([`ProcessBackend`](super::ProcessBackend)) for local
//! runs.
//!
//! A backend owns two kinds of resources per step: a scratch area (named by
//! the step's `JobRef::scratch_name`) and the job itself. Both are released
//! explicitly; the dispatcher only does so when a step succeeds.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::exec::job_spec::JobSpec;
use crate::types::BoxFuture;

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_name: String,
}

/// What a backend reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Succeeded,
    Failed,
}

/// Trait abstracting how step jobs are executed.
pub trait JobBackend: Send + Sync {
    /// Create the scratch area a job will run in.
    fn provision_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Submit a job. Returning an error means the backend rejected it.
    fn submit(&self, spec: JobSpec) -> BoxFuture<'_, Result<JobHandle>>;

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<JobState>>;

    /// Remove the job (stopping it if it is still running).
    fn teardown<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>>;

    fn release_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>>;
}
