// src/dag/mod.rs

//! Step discovery.
//!
//! - [`scheduler`] holds the fixed-point discovery pass: which operators can
//!   run against the current data pool, with which inputs, without creating
//!   cycles or duplicate steps.
//! - [`cartesian`] expands per-slot candidate lists into concrete bindings.
//! - [`scheduler_step`] defines the per-pass result types.

pub mod cartesian;
pub mod scheduler;
pub mod scheduler_step;

pub use scheduler::{Scheduler, SchedulerLimits, slot_options};
pub use scheduler_step::{SchedulerPass, StepInvocation};
