// error.rs - Error taxonomy shared by the pipeline core, storage backends and API
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::workflow::graph::StageName;

/// Errors surfaced by the orchestration core and its storage.
///
/// `StageFailure` and `MissingArtifact` never escape a run: the orchestrator
/// folds them into `PipelineState::errors`. They exist as values so the
/// executor and guards can format them consistently.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stage '{stage}' failed: {message}")]
    StageFailure { stage: StageName, message: String },

    #[error("Missing artifact '{artifact}' after stage '{stage}'")]
    MissingArtifact {
        stage: StageName,
        artifact: &'static str,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid cost: tokens={tokens}, usd={usd}")]
    InvalidCost { tokens: i64, usd: Decimal },

    #[error("No checkpoint found for project {0}")]
    CheckpointNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        PipelineError::Storage(format!("migration failed: {}", e))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Storage(format!("serialization failed: {}", e))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure reported by an external stage collaborator.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("required input '{0}' is not available")]
    MissingInput(&'static str),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed(message.into())
    }
}
