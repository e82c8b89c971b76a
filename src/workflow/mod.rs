// Workflow orchestration module - stage graph, executor, checkpoints and the run loop
pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod router;
pub mod stages;
pub mod state;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, PgCheckpointStore};
pub use executor::{StageExecutor, StageOutcome};
pub use graph::{PipelineGraph, StageName};
pub use orchestrator::{PipelineOrchestrator, RunSummary};
pub use stages::{Collaborators, Stage, StageOutput, StageRegistry};
pub use state::{PipelineState, PipelineStatus};
