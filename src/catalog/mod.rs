// src/catalog/mod.rs

//! Operator and data-kind catalog.
//!
//! The catalog is an external collaborator: something that can list the
//! available [`Operator`]s and [`DataKind`]s. The engine fetches it once when
//! a run starts and hands the resulting immutable [`Catalog`] snapshot to the
//! run driver, so a catalog refresh never changes a run mid-flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{DatamillError, Result};
use crate::types::{BoxFuture, DataKindName, OperatorName, SlotName};

/// A named artifact type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKind {
    pub name: DataKindName,
    pub display_name: String,
}

/// One named input of an operator, requiring a single data unit of a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: SlotName,
    pub data_kind: DataKindName,
}

/// A caller-configurable parameter together with its default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub default_value: String,
}

/// A resolved `NAME=value` pair handed to the operator's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A containerized transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub name: OperatorName,
    pub image: String,
    /// Shell command run by backends that execute operators as local
    /// processes rather than containers.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Input slots, ordered by slot name.
    pub inputs: Vec<InputSlot>,
    pub possible_output_kinds: Vec<DataKindName>,
    pub constant_env: Vec<EnvVar>,
    pub configurable_env: Vec<ParamSpec>,
}

impl Operator {
    /// Distinct data kinds this operator needs to be runnable.
    pub fn input_kinds(&self) -> BTreeSet<&str> {
        self.inputs.iter().map(|slot| slot.data_kind.as_str()).collect()
    }
}

/// Immutable snapshot of the catalog for the lifetime of one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    data_kinds: BTreeMap<DataKindName, DataKind>,
    operators: Vec<Operator>,
}

impl Catalog {
    /// Build a snapshot, checking that every operator only references
    /// declared data kinds and that names are unique.
    pub fn new(data_kinds: Vec<DataKind>, operators: Vec<Operator>) -> Result<Self> {
        let mut kinds = BTreeMap::new();
        for kind in data_kinds {
            if kinds.insert(kind.name.clone(), kind).is_some() {
                return Err(DatamillError::ConfigError(
                    "duplicate data kind in catalog".to_string(),
                ));
            }
        }

        let mut seen = BTreeSet::new();
        let mut ops = Vec::with_capacity(operators.len());
        for mut op in operators {
            if !seen.insert(op.name.clone()) {
                return Err(DatamillError::ConfigError(format!(
                    "duplicate operator '{}' in catalog",
                    op.name
                )));
            }

            let mut slot_names = BTreeSet::new();
            for slot in &op.inputs {
                if !slot_names.insert(slot.name.as_str()) {
                    return Err(DatamillError::ConfigError(format!(
                        "operator '{}' declares input slot '{}' twice",
                        op.name, slot.name
                    )));
                }
                if !kinds.contains_key(&slot.data_kind) {
                    return Err(DatamillError::ConfigError(format!(
                        "operator '{}' input '{}' references unknown data kind '{}'",
                        op.name, slot.name, slot.data_kind
                    )));
                }
            }

            for kind in &op.possible_output_kinds {
                if !kinds.contains_key(kind) {
                    return Err(DatamillError::ConfigError(format!(
                        "operator '{}' lists unknown output kind '{}'",
                        op.name, kind
                    )));
                }
            }

            op.inputs.sort_by(|a, b| a.name.cmp(&b.name));
            ops.push(op);
        }
        ops.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            data_kinds = kinds.len(),
            operators = ops.len(),
            "catalog snapshot built"
        );

        Ok(Self {
            data_kinds: kinds,
            operators: ops,
        })
    }

    /// Fetch a fresh snapshot from a catalog source.
    pub async fn fetch(source: &dyn CatalogSource) -> Result<Self> {
        let data_kinds = source.list_data_kinds().await?;
        let operators = source.list_operators().await?;
        Self::new(data_kinds, operators)
    }

    /// Operators, ordered by name.
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn operator(&self, name: &str) -> Option<&Operator> {
        self.operators.iter().find(|op| op.name == name)
    }

    pub fn data_kinds(&self) -> impl Iterator<Item = &DataKind> {
        self.data_kinds.values()
    }

    pub fn has_data_kind(&self, name: &str) -> bool {
        self.data_kinds.contains_key(name)
    }
}

/// Where operator and data-kind definitions come from.
pub trait CatalogSource: Send + Sync {
    fn list_operators(&self) -> BoxFuture<'_, Result<Vec<Operator>>>;
    fn list_data_kinds(&self) -> BoxFuture<'_, Result<Vec<DataKind>>>;
}

/// A catalog source that always returns the same snapshot.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    data_kinds: Vec<DataKind>,
    operators: Vec<Operator>,
}

impl StaticCatalog {
    pub fn new(data_kinds: Vec<DataKind>, operators: Vec<Operator>) -> Self {
        Self {
            data_kinds,
            operators,
        }
    }

    pub fn shared(self) -> Arc<dyn CatalogSource> {
        Arc::new(self)
    }
}

impl CatalogSource for StaticCatalog {
    fn list_operators(&self) -> BoxFuture<'_, Result<Vec<Operator>>> {
        let operators = self.operators.clone();
        Box::pin(async move { Ok(operators) })
    }

    fn list_data_kinds(&self) -> BoxFuture<'_, Result<Vec<DataKind>>> {
        let kinds = self.data_kinds.clone();
        Box::pin(async move { Ok(kinds) })
    }
}
