// src/types.rs

//! Identifier aliases and the run/step state machines.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub type RunId = String;
pub type StepId = String;
pub type DataUnitId = String;
pub type OperatorName = String;
pub type DataKindName = String;
/// Name of an operator input slot. Doubles as the env var the staged input
/// path is exposed under.
pub type SlotName = String;

/// Boxed future returned by the pluggable collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lifecycle of a run.
///
/// `Created -> Running -> {Complete | Terminated}`, with `Terminated` also
/// reachable directly from `Created`. Both `Complete` and `Terminated` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Complete,
    Terminated,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Terminated)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Running) | (Created, Terminated) | (Running, Complete) | (Running, Terminated)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single step.
///
/// `Created -> Running -> {Success | Failure}`. A step whose job could not be
/// submitted goes straight from `Created` to `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Created,
    Running,
    Success,
    Failure,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failure)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Created, Running) | (Created, Failure) | (Running, Success) | (Running, Failure)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Created => "created",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}
