// src/config/mod.rs

//! Configuration loading and validation for datamill.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate names and references (`validate.rs`).
//!
//! The configured data kinds and operators double as the catalog source.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, ConfigSection, DataKindConfig, OperatorConfig, RawConfigFile, RetrySection};
