// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::{DataKind, EnvVar, InputSlot, Operator, ParamSpec, StaticCatalog};
use crate::dag::SchedulerLimits;
use crate::exec::DispatcherOptions;
use crate::engine::EngineOptions;
use crate::store::{RetryPolicy, StepVisibility};

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// poll_interval_ms = 1000
///
/// [datakind.numbers]
/// display_name = "Numbers"
///
/// [operator.sum]
/// image = "registry.local/sum:1"
/// command = "paste -sd+ \"$A\" | bc > \"$DATAMILL_OUTPUT_DIR/sum.txt\""
/// inputs = { A = "numbers" }
/// possible_output_kinds = ["total"]
/// configurable_env = { PRECISION = "2" }
/// ```
///
/// All sections except `datakind` are optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Keys are data kind names.
    #[serde(default)]
    pub datakind: BTreeMap<String, DataKindConfig>,

    /// Keys are operator names.
    #[serde(default)]
    pub operator: BTreeMap<String, OperatorConfig>,
}

/// Validated configuration. Build one with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub datakind: BTreeMap<String, DataKindConfig>,
    pub operator: BTreeMap<String, OperatorConfig>,
}

impl ConfigFile {
    /// Assemble without validating. Only `TryFrom<RawConfigFile>` and tests
    /// should need this.
    pub fn new_unchecked(
        config: ConfigSection,
        datakind: BTreeMap<String, DataKindConfig>,
        operator: BTreeMap<String, OperatorConfig>,
    ) -> Self {
        Self {
            config,
            datakind,
            operator,
        }
    }

    pub fn data_kinds(&self) -> Vec<DataKind> {
        self.datakind
            .iter()
            .map(|(name, kind)| DataKind {
                name: name.clone(),
                display_name: kind.display_name.clone().unwrap_or_else(|| name.clone()),
            })
            .collect()
    }

    pub fn operators(&self) -> Vec<Operator> {
        self.operator
            .iter()
            .map(|(name, op)| op.to_operator(name))
            .collect()
    }

    /// The configured data kinds and operators as a catalog source.
    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::new(self.data_kinds(), self.operators())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            limits: self.config.scheduler_limits(),
            dispatcher: DispatcherOptions {
                poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            },
        }
    }
}

/// `[config]` section: engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    /// How often running jobs are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Scheduling passes allowed per run before it is failed.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Candidate bindings allowed per pass before the run is failed.
    #[serde(default = "default_max_bindings_per_pass")]
    pub max_bindings_per_pass: usize,

    #[serde(default = "default_step_visibility_retries")]
    pub step_visibility_retries: u32,

    #[serde(default = "default_step_visibility_delay_ms")]
    pub step_visibility_delay_ms: u64,

    #[serde(default)]
    pub retry: RetrySection,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_passes() -> usize {
    SchedulerLimits::default().max_passes
}

fn default_max_bindings_per_pass() -> usize {
    SchedulerLimits::default().max_bindings_per_pass
}

fn default_step_visibility_retries() -> u32 {
    StepVisibility::default().retries
}

fn default_step_visibility_delay_ms() -> u64 {
    1000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_passes: default_max_passes(),
            max_bindings_per_pass: default_max_bindings_per_pass(),
            step_visibility_retries: default_step_visibility_retries(),
            step_visibility_delay_ms: default_step_visibility_delay_ms(),
            retry: RetrySection::default(),
        }
    }
}

impl ConfigSection {
    pub fn scheduler_limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            max_passes: self.max_passes,
            max_bindings_per_pass: self.max_bindings_per_pass,
        }
    }

    pub fn step_visibility(&self) -> StepVisibility {
        StepVisibility {
            retries: self.step_visibility_retries,
            delay: Duration::from_millis(self.step_visibility_delay_ms),
        }
    }
}

/// `[config.retry]`: backoff for store revision conflicts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    50
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// `[datakind.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DataKindConfig {
    /// Human-readable name; defaults to the key.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// `[operator.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorConfig {
    /// Container image a cluster backend would run.
    pub image: String,

    /// Shell command for the local process backend. Inputs and parameters
    /// are available as environment variables.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// `SLOT = "datakind"`. The slot name is also the env var carrying the
    /// staged input path.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default)]
    pub possible_output_kinds: Vec<String>,

    /// Env vars passed as-is.
    #[serde(default)]
    pub constant_env: BTreeMap<String, String>,

    /// Env vars a run may override; the value here is the default.
    #[serde(default)]
    pub configurable_env: BTreeMap<String, String>,
}

impl OperatorConfig {
    pub fn to_operator(&self, name: &str) -> Operator {
        Operator {
            name: name.to_string(),
            image: self.image.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|(slot, kind)| InputSlot {
                    name: slot.clone(),
                    data_kind: kind.clone(),
                })
                .collect(),
            possible_output_kinds: self.possible_output_kinds.clone(),
            constant_env: self
                .constant_env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            configurable_env: self
                .configurable_env
                .iter()
                .map(|(name, default_value)| ParamSpec {
                    name: name.clone(),
                    default_value: default_value.clone(),
                })
                .collect(),
        }
    }
}
