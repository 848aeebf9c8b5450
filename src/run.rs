// src/run.rs

//! Run and step records as stored in the run state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lineage::DataUnit;
use crate::types::{DataUnitId, OperatorName, RunId, RunStatus, SlotName, StepId, StepStatus};

/// A caller-supplied (or listed) operator parameter.
///
/// `value` is the caller's choice; `None` means "use the default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl Param {
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            default_value: None,
        }
    }
}

/// Parameters per operator, as supplied when a run is started.
pub type ParamPool = BTreeMap<OperatorName, Vec<Param>>;

/// Names of the backend resources held by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_name: String,
    pub scratch_name: String,
}

impl JobRef {
    pub fn for_step(step_id: &str) -> Self {
        let job_name = format!("datamill-job-{step_id}");
        Self {
            scratch_name: format!("{job_name}-scratch"),
            job_name,
        }
    }
}

/// One committed invocation of an operator with concrete input bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: StepId,
    pub operator: OperatorName,
    /// Slot name -> bound data unit. Immutable after creation.
    pub input_data_units: BTreeMap<SlotName, DataUnitId>,
    pub output_data_units: Vec<DataUnitId>,
    pub status: StepStatus,
    pub job_ref: JobRef,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl RunStep {
    pub fn new(operator: impl Into<OperatorName>, inputs: BTreeMap<SlotName, DataUnitId>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            job_ref: JobRef::for_step(&id),
            id,
            operator: operator.into(),
            input_data_units: inputs,
            output_data_units: Vec::new(),
            status: StepStatus::Created,
            started_at: None,
            ended_at: None,
            duration_ms: None,
        }
    }

    /// Whether this step has the given `(operator, inputs)` identity key.
    pub fn has_identity(&self, operator: &str, inputs: &BTreeMap<SlotName, DataUnitId>) -> bool {
        self.operator == operator && &self.input_data_units == inputs
    }
}

/// One execution of the pipeline over a growing data pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub steps: Vec<RunStep>,
    pub data_pool: Vec<DataUnit>,
    pub param_pool: ParamPool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Why the engine gave up on the run, if it did.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Run {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: RunStatus::Created,
            steps: Vec::new(),
            data_pool: Vec::new(),
            param_pool: ParamPool::new(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            error: None,
            deleted: false,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&RunStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut RunStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn data_unit(&self, unit_id: &str) -> Option<&DataUnit> {
        self.data_pool.iter().find(|u| u.id == unit_id)
    }

    pub fn has_step_with_identity(
        &self,
        operator: &str,
        inputs: &BTreeMap<SlotName, DataUnitId>,
    ) -> bool {
        self.steps.iter().any(|s| s.has_identity(operator, inputs))
    }

    /// Steps that have not reached `Success` or `Failure`.
    pub fn unfinished_steps(&self) -> impl Iterator<Item = &RunStep> {
        self.steps.iter().filter(|s| !s.status.is_terminal())
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn elapsed_ms(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<i64> {
    start.map(|s| (end - s).num_milliseconds())
}
