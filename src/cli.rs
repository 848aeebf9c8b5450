// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `datamill`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "datamill",
    version,
    about = "Grow a data pool by running every operator whose inputs are available.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Datamill.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Datamill.toml")]
    pub config: PathBuf,

    /// Seed the run with a file as a data unit of the given kind.
    /// May be repeated.
    #[arg(long = "upload", value_name = "KIND=PATH", value_parser = parse_upload)]
    pub uploads: Vec<UploadArg>,

    /// Override an operator parameter. May be repeated.
    #[arg(long = "param", value_name = "OPERATOR.NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<ParamArg>,

    /// Directory for run documents, artifacts and job scratch areas.
    #[arg(long, value_name = "DIR", default_value = ".datamill")]
    pub work_dir: PathBuf,

    /// Keep run documents and artifacts in memory instead of `--work-dir`.
    #[arg(long)]
    pub memory: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DATAMILL_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Register the uploads and print the parameters of every operator that
    /// could run, without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// `--upload KIND=PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadArg {
    pub data_kind: String,
    pub path: PathBuf,
}

/// `--param OPERATOR.NAME=VALUE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamArg {
    pub operator: String,
    pub name: String,
    pub value: String,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse_upload(s: &str) -> Result<UploadArg, String> {
    let (kind, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=PATH, got '{s}'"))?;
    if kind.is_empty() || path.is_empty() {
        return Err(format!("expected KIND=PATH, got '{s}'"));
    }
    Ok(UploadArg {
        data_kind: kind.to_string(),
        path: PathBuf::from(path),
    })
}

pub fn parse_param(s: &str) -> Result<ParamArg, String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected OPERATOR.NAME=VALUE, got '{s}'"))?;
    let (operator, name) = key
        .split_once('.')
        .ok_or_else(|| format!("expected OPERATOR.NAME=VALUE, got '{s}'"))?;
    if operator.is_empty() || name.is_empty() {
        return Err(format!("expected OPERATOR.NAME=VALUE, got '{s}'"));
    }
    Ok(ParamArg {
        operator: operator.to_string(),
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
