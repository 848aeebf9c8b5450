// src/exec/mod.rs

//! Job execution layer.
//!
//! - [`job_spec`] describes a step's job independent of any backend.
//! - [`backend`] provides the `JobBackend` trait the dispatcher talks to,
//!   which tests replace with a fake implementation.
//! - [`process`] is the local backend running operators as child processes.
//! - [`dispatcher`] drives one step from submission to its terminal status.

pub mod backend;
pub mod dispatcher;
pub mod job_spec;
pub mod process;

pub use backend::{JobBackend, JobHandle, JobState};
pub use dispatcher::{DispatcherOptions, JobDispatcher};
pub use job_spec::{JobSpec, ManifestEntry, OutputManifest};
pub use process::ProcessBackend;
