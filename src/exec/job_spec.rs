// src/exec/job_spec.rs

//! Backend-neutral description of one step's job.
//!
//! A job runs in three phases against a scratch area scoped to the step:
//!
//! 1. stage-in: fetch every bound data unit into `inputs/<unit id>`
//! 2. the operator itself, with its environment resolved
//! 3. stage-out: read the operator's output manifest and register every
//!    listed artifact with the producing step
//!
//! All paths are relative to the scratch root, which is also the operator's
//! working directory.

use serde::{Deserialize, Serialize};

use crate::catalog::{EnvVar, Operator};
use crate::errors::{DatamillError, Result};
use crate::params::{merge_params, params_for};
use crate::run::{Run, RunStep};
use crate::types::{DataKindName, DataUnitId, OperatorName, RunId, SlotName, StepId};

/// Env var holding the directory the operator must write its outputs to.
pub const OUTPUT_DIR_ENV: &str = "DATAMILL_OUTPUT_DIR";
/// Output directory, relative to the scratch root.
pub const OUTPUT_DIR: &str = "output";
/// Directory staged inputs are written to, relative to the scratch root.
pub const INPUT_DIR: &str = "inputs";
/// Manifest an operator writes into its output directory.
pub const MANIFEST_FILE: &str = "out.json";

/// One input to fetch before the operator starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedInput {
    pub slot: SlotName,
    pub unit_id: DataUnitId,
    pub path: String,
}

/// The operator container and its resolved environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorContainer {
    pub name: OperatorName,
    pub image: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
}

/// Where produced artifacts go once the operator is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOut {
    pub run_id: RunId,
    pub step_id: StepId,
    pub output_dir: String,
    /// Kinds the operator may produce; anything else is rejected.
    pub allowed_kinds: Vec<DataKindName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_name: String,
    pub scratch_name: String,
    pub stage_in: Vec<StagedInput>,
    pub operator: OperatorContainer,
    pub stage_out: StageOut,
}

impl JobSpec {
    /// Describe the job for `step` of `run`, running `operator`.
    ///
    /// The environment is, in order: the operator's constant env, its
    /// configurable env merged with the run's parameter pool, one variable
    /// per input slot pointing at the staged input, and the output dir.
    pub fn build(run: &Run, step: &RunStep, operator: &Operator) -> Result<Self> {
        if step.operator != operator.name {
            return Err(DatamillError::InvalidState(format!(
                "step {} runs '{}' but was dispatched with operator '{}'",
                step.id, step.operator, operator.name
            )));
        }

        let mut stage_in = Vec::with_capacity(step.input_data_units.len());
        for (slot, unit_id) in &step.input_data_units {
            if run.data_unit(unit_id).is_none() {
                return Err(DatamillError::NotFound {
                    kind: "data unit",
                    id: unit_id.clone(),
                });
            }
            stage_in.push(StagedInput {
                slot: slot.clone(),
                unit_id: unit_id.clone(),
                path: format!("{INPUT_DIR}/{unit_id}"),
            });
        }

        let mut env = operator.constant_env.clone();
        env.extend(merge_params(
            &operator.configurable_env,
            params_for(&run.param_pool, &operator.name),
        ));
        env.extend(stage_in.iter().map(|input| EnvVar {
            name: input.slot.clone(),
            value: input.path.clone(),
        }));
        env.push(EnvVar {
            name: OUTPUT_DIR_ENV.to_string(),
            value: OUTPUT_DIR.to_string(),
        });

        Ok(Self {
            job_name: step.job_ref.job_name.clone(),
            scratch_name: step.job_ref.scratch_name.clone(),
            stage_in,
            operator: OperatorContainer {
                name: operator.name.clone(),
                image: operator.image.clone(),
                command: operator.command.clone(),
                args: operator.args.clone(),
                env,
            },
            stage_out: StageOut {
                run_id: run.id.clone(),
                step_id: step.id.clone(),
                output_dir: OUTPUT_DIR.to_string(),
                allowed_kinds: operator.possible_output_kinds.clone(),
            },
        })
    }
}

/// `out.json`: what the operator produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutputManifest {
    #[serde(default)]
    pub outputs: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "dataKind")]
    pub data_kind: DataKindName,
    /// Path of the artifact, relative to the output directory.
    pub file: String,
}
