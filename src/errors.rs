// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatamillError {
    /// A run, step, data unit or data kind referenced by id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic-concurrency revision mismatch. Only ever produced by a
    /// `DocumentStore`; `RunStore` retries it internally.
    #[error("revision conflict on run {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("job backend failure: {0}")]
    BackendDispatchFailure(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DatamillError {
    pub fn run_not_found(id: impl Into<String>) -> Self {
        DatamillError::NotFound {
            kind: "run",
            id: id.into(),
        }
    }

    pub fn step_not_found(id: impl Into<String>) -> Self {
        DatamillError::NotFound {
            kind: "step",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatamillError::NotFound { .. })
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DatamillError>;
