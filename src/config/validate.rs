// src/config/validate.rs

use std::collections::BTreeSet;

use regex::Regex;

use crate::config::model::{ConfigFile, OperatorConfig, RawConfigFile};
use crate::errors::{DatamillError, Result};
use crate::exec::job_spec::OUTPUT_DIR_ENV;

/// Operator and data kind names end up in job and scratch resource names.
const RESOURCE_NAME: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";
const ENV_NAME: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

struct NameRules {
    resource: Regex,
    env: Regex,
}

impl NameRules {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| DatamillError::ConfigError(format!("name pattern: {e}")))
        };
        Ok(Self {
            resource: compile(RESOURCE_NAME)?,
            env: compile(ENV_NAME)?,
        })
    }
}

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DatamillError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.datakind, raw.operator))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_data_kinds(cfg)?;
    validate_global_config(cfg)?;
    let rules = NameRules::new()?;
    validate_names(cfg, &rules)?;
    for (name, op) in cfg.operator.iter() {
        validate_operator(cfg, &rules, name, op)?;
    }
    Ok(())
}

fn ensure_has_data_kinds(cfg: &RawConfigFile) -> Result<()> {
    if cfg.datakind.is_empty() {
        return Err(DatamillError::ConfigError(
            "config must contain at least one [datakind.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    let c = &cfg.config;

    if c.poll_interval_ms == 0 {
        return Err(DatamillError::ConfigError(
            "[config].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.max_passes == 0 {
        return Err(DatamillError::ConfigError(
            "[config].max_passes must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.max_bindings_per_pass == 0 {
        return Err(DatamillError::ConfigError(
            "[config].max_bindings_per_pass must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.retry.max_attempts == 0 {
        return Err(DatamillError::ConfigError(
            "[config.retry].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if !c.retry.multiplier.is_finite() || c.retry.multiplier < 1.0 {
        return Err(DatamillError::ConfigError(format!(
            "[config.retry].multiplier must be a finite number >= 1.0 (got {})",
            c.retry.multiplier
        )));
    }
    if c.retry.initial_delay_ms > c.retry.max_delay_ms {
        return Err(DatamillError::ConfigError(format!(
            "[config.retry].initial_delay_ms ({}) is larger than max_delay_ms ({})",
            c.retry.initial_delay_ms, c.retry.max_delay_ms
        )));
    }

    Ok(())
}

fn validate_names(cfg: &RawConfigFile, rules: &NameRules) -> Result<()> {
    for name in cfg.datakind.keys() {
        if !rules.resource.is_match(name) {
            return Err(DatamillError::ConfigError(format!(
                "data kind name '{name}' must be lowercase letters, digits and '-'"
            )));
        }
    }
    for name in cfg.operator.keys() {
        if !rules.resource.is_match(name) {
            return Err(DatamillError::ConfigError(format!(
                "operator name '{name}' must be lowercase letters, digits and '-'"
            )));
        }
    }
    Ok(())
}

fn validate_operator(
    cfg: &RawConfigFile,
    rules: &NameRules,
    name: &str,
    op: &OperatorConfig,
) -> Result<()> {
    if op.image.trim().is_empty() {
        return Err(DatamillError::ConfigError(format!(
            "operator '{name}' has an empty `image`"
        )));
    }

    for (slot, kind) in op.inputs.iter() {
        if !cfg.datakind.contains_key(kind) {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' input '{slot}' references unknown data kind '{kind}'"
            )));
        }
        if !rules.env.is_match(slot) {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' input '{slot}' is not a valid environment variable name"
            )));
        }
    }

    for kind in op.possible_output_kinds.iter() {
        if !cfg.datakind.contains_key(kind) {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' may produce unknown data kind '{kind}'"
            )));
        }
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let env_names = op
        .inputs
        .keys()
        .chain(op.constant_env.keys())
        .chain(op.configurable_env.keys());
    for env in env_names {
        if !rules.env.is_match(env) {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' env var '{env}' is not a valid environment variable name"
            )));
        }
        if env == OUTPUT_DIR_ENV {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' may not set reserved env var '{OUTPUT_DIR_ENV}'"
            )));
        }
        if !seen.insert(env.as_str()) {
            return Err(DatamillError::ConfigError(format!(
                "operator '{name}' declares '{env}' more than once across inputs, constant_env and configurable_env"
            )));
        }
    }

    Ok(())
}
