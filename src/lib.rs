// lib.rs - Screencast editing pipeline: orchestration core, storage and operator API
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod middleware;
pub mod pricing;
pub mod projects;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{PipelineError, PipelineResult, StageError};
pub use projects::ProjectManager;
pub use workflow::{PipelineOrchestrator, PipelineState, RunSummary};

/// Shared state handed to every API handler
pub struct AppState {
    pub projects: ProjectManager,
    /// Default retention window for cleanup, in days
    pub retention_days: i64,
}
