#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use datamill::catalog::{Catalog, CatalogSource, DataKind, EnvVar, InputSlot, Operator, ParamSpec, StaticCatalog};
use datamill::config::{ConfigFile, ConfigSection, DataKindConfig, OperatorConfig, RawConfigFile};
use datamill::lineage::DataUnit;
use datamill::run::{Run, RunStep};
use datamill::types::DataUnitId;

/// Builder for `Operator`.
pub struct OperatorBuilder {
    op: Operator,
}

impl OperatorBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            op: Operator {
                name: name.to_string(),
                image: format!("registry.test/{name}:latest"),
                command: None,
                args: Vec::new(),
                inputs: Vec::new(),
                possible_output_kinds: Vec::new(),
                constant_env: Vec::new(),
                configurable_env: Vec::new(),
            },
        }
    }

    pub fn input(mut self, slot: &str, kind: &str) -> Self {
        self.op.inputs.push(InputSlot {
            name: slot.to_string(),
            data_kind: kind.to_string(),
        });
        self.op.inputs.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    pub fn output(mut self, kind: &str) -> Self {
        self.op.possible_output_kinds.push(kind.to_string());
        self
    }

    pub fn param(mut self, name: &str, default_value: &str) -> Self {
        self.op.configurable_env.push(ParamSpec {
            name: name.to_string(),
            default_value: default_value.to_string(),
        });
        self
    }

    pub fn constant(mut self, name: &str, value: &str) -> Self {
        self.op.constant_env.push(EnvVar {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.op.command = Some(command.to_string());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.op.args.push(arg.to_string());
        self
    }

    pub fn build(self) -> Operator {
        self.op
    }
}

/// Builder for a catalog of data kinds and operators.
#[derive(Default)]
pub struct CatalogBuilder {
    kinds: Vec<DataKind>,
    operators: Vec<Operator>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, name: &str) -> Self {
        self.kinds.push(DataKind {
            name: name.to_string(),
            display_name: name.to_uppercase(),
        });
        self
    }

    pub fn kinds(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.kind(name);
        }
        self
    }

    pub fn operator(mut self, op: Operator) -> Self {
        self.operators.push(op);
        self
    }

    pub fn build(self) -> Catalog {
        Catalog::new(self.kinds, self.operators).expect("Failed to build valid catalog from builder")
    }

    pub fn source(self) -> Arc<dyn CatalogSource> {
        StaticCatalog::new(self.kinds, self.operators).shared()
    }
}

/// Builder for run snapshots used by scheduler tests.
pub struct RunBuilder {
    run: Run,
}

impl RunBuilder {
    pub fn new() -> Self {
        Self { run: Run::new() }
    }

    /// Add an uploaded unit with a fixed id.
    pub fn upload(mut self, id: &str, kind: &str) -> Self {
        self.run.data_pool.push(DataUnit {
            id: id.to_string(),
            data_kind: kind.to_string(),
            ancestors: BTreeSet::new(),
        });
        self
    }

    /// Add a unit with the given ancestry.
    pub fn unit(mut self, id: &str, kind: &str, ancestors: &[&str]) -> Self {
        self.run.data_pool.push(DataUnit {
            id: id.to_string(),
            data_kind: kind.to_string(),
            ancestors: ancestors.iter().map(|a| a.to_string()).collect(),
        });
        self
    }

    /// Add a step binding `operator` to `(slot, unit id)` pairs.
    pub fn step(mut self, operator: &str, inputs: &[(&str, &str)]) -> Self {
        self.run.steps.push(RunStep::new(operator, bindings(inputs)));
        self
    }

    pub fn build(self) -> Run {
        self.run
    }
}

impl Default for RunBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `[(slot, unit)]` as a binding map.
pub fn bindings(inputs: &[(&str, &str)]) -> BTreeMap<String, DataUnitId> {
    inputs
        .iter()
        .map(|(slot, unit)| (slot.to_string(), unit.to_string()))
        .collect()
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                datakind: BTreeMap::new(),
                operator: BTreeMap::new(),
            },
        }
    }

    pub fn with_kind(mut self, name: &str) -> Self {
        self.config
            .datakind
            .insert(name.to_string(), DataKindConfig::default());
        self
    }

    pub fn with_operator(mut self, name: &str, op: OperatorConfig) -> Self {
        self.config.operator.insert(name.to_string(), op);
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.config.poll_interval_ms = ms;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `OperatorConfig`.
pub struct OperatorConfigBuilder {
    op: OperatorConfig,
}

impl OperatorConfigBuilder {
    pub fn new(image: &str) -> Self {
        Self {
            op: OperatorConfig {
                image: image.to_string(),
                command: None,
                args: Vec::new(),
                inputs: BTreeMap::new(),
                possible_output_kinds: Vec::new(),
                constant_env: BTreeMap::new(),
                configurable_env: BTreeMap::new(),
            },
        }
    }

    pub fn input(mut self, slot: &str, kind: &str) -> Self {
        self.op.inputs.insert(slot.to_string(), kind.to_string());
        self
    }

    pub fn output(mut self, kind: &str) -> Self {
        self.op.possible_output_kinds.push(kind.to_string());
        self
    }

    pub fn constant(mut self, name: &str, value: &str) -> Self {
        self.op.constant_env.insert(name.to_string(), value.to_string());
        self
    }

    pub fn param(mut self, name: &str, default_value: &str) -> Self {
        self.op
            .configurable_env
            .insert(name.to_string(), default_value.to_string());
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.op.command = Some(command.to_string());
        self
    }

    pub fn build(self) -> OperatorConfig {
        self.op
    }
}
