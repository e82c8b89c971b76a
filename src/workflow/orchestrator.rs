// Orchestrator - Interprets the stage graph over a single pipeline state
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointStore;
use super::executor::StageExecutor;
use super::graph::{PipelineGraph, StageName, Step};
use super::router::{Route, Verdict};
use super::stages::{Collaborators, StageRegistry};
use super::state::{PipelineState, PipelineStatus};
use crate::config::{PipelineConfig, Settings, UserPreferences};
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::StageLedger;
use crate::projects::{ProjectStatus, ProjectStore};

const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;

/// Caller-facing result of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub status: PipelineStatus,
    pub project_id: String,
    pub output_video: Option<String>,
    pub processing_time: Option<f64>,
    pub total_cost_usd: Decimal,
    pub total_tokens: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub completed_stages: Vec<StageName>,
}

impl From<&PipelineState> for RunSummary {
    fn from(state: &PipelineState) -> Self {
        Self {
            status: state.status(),
            project_id: state.project_id().to_string(),
            output_video: state.final_video_path.clone(),
            processing_time: state.processing_time(),
            total_cost_usd: state.total_cost_usd(),
            total_tokens: state.total_tokens(),
            errors: state.errors().to_vec(),
            warnings: state.warnings().to_vec(),
            completed_stages: state.completed_stages().to_vec(),
        }
    }
}

/// Drives runs through the graph.
///
/// The state is owned by the run; stages only see it immutably and every
/// mutation happens here, one outcome at a time.
pub struct PipelineOrchestrator {
    graph: PipelineGraph,
    registry: StageRegistry,
    executor: StageExecutor,
    projects: Option<Arc<dyn ProjectStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    checkpoint_after_each_stage: bool,
    permits: Arc<Semaphore>,
}

impl PipelineOrchestrator {
    /// Fails when a graph node has no registered stage
    pub fn new(
        graph: PipelineGraph,
        registry: StageRegistry,
        ledger: Arc<dyn StageLedger>,
    ) -> PipelineResult<Self> {
        registry.ensure_covers(&graph)?;
        Ok(Self {
            graph,
            registry,
            executor: StageExecutor::new(ledger),
            projects: None,
            checkpoints: None,
            checkpoint_after_each_stage: false,
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_RUNS)),
        })
    }

    /// Standard graph over `collaborators`, with checkpointing and run
    /// concurrency taken from `settings`
    pub fn from_settings(
        settings: &Settings,
        collaborators: Collaborators,
        ledger: Arc<dyn StageLedger>,
        projects: Arc<dyn ProjectStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> PipelineResult<Self> {
        let orchestrator = Self::new(
            PipelineGraph::standard()?,
            collaborators.into_registry(),
            ledger,
        )?
        .with_project_store(projects)
        .with_checkpoints(checkpoints, settings.checkpoint_after_each_stage)
        .with_max_concurrent_runs(settings.max_concurrent_projects);
        Ok(orchestrator)
    }

    pub fn with_executor(mut self, executor: StageExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_project_store(mut self, projects: Arc<dyn ProjectStore>) -> Self {
        self.projects = Some(projects);
        self
    }

    /// `after_each_stage` snapshots the state after every stage; otherwise
    /// the store is only used by `resume`.
    pub fn with_checkpoints(
        mut self,
        checkpoints: Arc<dyn CheckpointStore>,
        after_each_stage: bool,
    ) -> Self {
        self.checkpoints = Some(checkpoints);
        self.checkpoint_after_each_stage = after_each_stage;
        self
    }

    pub fn with_max_concurrent_runs(mut self, max_runs: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max_runs.max(1)));
        self
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Create the state for a project and run it to completion.
    ///
    /// With a project store configured the project must already exist
    /// (see `ProjectManager::create_project`); ledger rows reference it.
    pub async fn execute_pipeline(
        &self,
        project_id: &str,
        video_path: &str,
        config: PipelineConfig,
        user_preferences: UserPreferences,
    ) -> PipelineResult<PipelineState> {
        let state = PipelineState::create(project_id, video_path, config, user_preferences)?;
        if let Some(projects) = &self.projects {
            if projects.get_project(project_id).await?.is_none() {
                return Err(PipelineError::Validation(format!(
                    "project {} does not exist",
                    project_id
                )));
            }
        }
        self.run(state).await
    }

    /// Continue a run from its saved checkpoint
    pub async fn resume(&self, project_id: &str) -> PipelineResult<PipelineState> {
        let checkpoints = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| PipelineError::Config("no checkpoint store configured".to_string()))?;

        let state = checkpoints
            .load(project_id)
            .await?
            .ok_or_else(|| PipelineError::CheckpointNotFound(project_id.to_string()))?;

        info!(
            project_id,
            completed = state.completed_stages().len(),
            "🔄 Resuming pipeline from checkpoint"
        );
        self.run(state).await
    }

    /// Run the state through the graph. Always ends at the output stage.
    ///
    /// A state that already finished is returned unchanged. The only errors
    /// are scheduling failures; stage failures end up in `state.errors()`.
    pub async fn run(&self, mut state: PipelineState) -> PipelineResult<PipelineState> {
        if state.is_finished() {
            debug!(project_id = state.project_id(), "Run already finished, nothing to do");
            return Ok(state);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipelineError::Storage(format!("run scheduler closed: {}", e)))?;

        info!(
            project_id = state.project_id(),
            video = state.video_path(),
            "🚀 Starting pipeline"
        );
        state.begin_run();
        self.project_started(&mut state).await;

        let terminal = self.graph.terminal();
        let mut current = self.graph.entry();

        while current != terminal {
            if state.is_failed() {
                warn!(
                    project_id = state.project_id(),
                    skipped = %current,
                    "⏭️ Pipeline failed, short-circuiting to output"
                );
                break;
            }

            self.run_stage(current, &mut state).await;

            let (step, route) = self.graph.next(current, &state);
            record_verdict(route, &mut state);

            current = match step {
                Step::Single(next) => next,
                Step::FanOut(branches) => self.run_fan_out(&branches, &mut state).await,
                Step::Finished => terminal,
            };
        }

        self.run_stage(terminal, &mut state).await;
        state.finalize(Utc::now());
        self.project_finished(&mut state).await;
        self.checkpoint(&mut state).await;

        info!(
            project_id = state.project_id(),
            status = ?state.status(),
            processing_time = state.processing_time().unwrap_or_default(),
            total_cost_usd = %state.total_cost_usd(),
            "🏁 Pipeline finished"
        );
        Ok(state)
    }

    /// Run one stage body unless it already completed in an earlier attempt
    async fn run_stage(&self, name: StageName, state: &mut PipelineState) {
        if state.is_stage_complete(name) {
            debug!(project_id = state.project_id(), stage = %name, "Stage already completed, skipping body");
            return;
        }

        let Some(stage) = self.registry.get(name) else {
            state.record_error(format!("No stage registered for '{}'", name));
            return;
        };

        self.project_stage(name, state).await;
        let outcome = self.executor.execute(name, stage.as_ref(), state).await;
        outcome.apply(state);
        self.checkpoint(state).await;
    }

    /// Run the pending branches concurrently, fold their outcomes, then join.
    ///
    /// Returns where the run continues: the terminal stage if any branch's
    /// edge routes there, otherwise the common join target.
    async fn run_fan_out(&self, branches: &[StageName], state: &mut PipelineState) -> StageName {
        let terminal = self.graph.terminal();
        if state.is_failed() {
            return terminal;
        }

        let mut pending = Vec::new();
        for branch in branches {
            if state.is_stage_complete(*branch) {
                continue;
            }
            match self.registry.get(*branch) {
                Some(stage) => pending.push((*branch, stage)),
                None => state.record_error(format!("No stage registered for '{}'", branch)),
            }
        }

        if !pending.is_empty() {
            let stage_list = pending
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            self.project_stage_label(&stage_list, state).await;
            info!(project_id = state.project_id(), branches = %stage_list, "⚡ Fan-out");

            let snapshot: &PipelineState = state;
            let outcomes = join_all(
                pending
                    .iter()
                    .map(|(name, stage)| self.executor.execute(*name, stage.as_ref(), snapshot)),
            )
            .await;

            // Applied in declaration order; branches write disjoint artifacts
            for outcome in outcomes {
                outcome.apply(state);
            }
            self.checkpoint(state).await;
        }

        let mut targets = Vec::with_capacity(branches.len());
        for branch in branches {
            let (step, route) = self.graph.next(*branch, state);
            record_verdict(route, state);
            match step {
                Step::Single(next) => targets.push(next),
                Step::FanOut(_) | Step::Finished => targets.push(terminal),
            }
        }

        if targets.contains(&terminal) {
            return terminal;
        }
        let join = targets[0];
        if targets.iter().any(|target| *target != join) {
            warn!(
                project_id = state.project_id(),
                ?targets,
                "Fan-out branches disagree on join target, continuing at {}",
                join
            );
        }
        join
    }

    async fn checkpoint(&self, state: &mut PipelineState) {
        if !self.checkpoint_after_each_stage {
            return;
        }
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        if let Err(e) = checkpoints.save(state.project_id(), state).await {
            warn!(project_id = state.project_id(), "⚠️ Failed to save checkpoint: {}", e);
            state.record_warning(format!("Checkpoint save failed: {}", e));
        }
    }

    async fn project_started(&self, state: &mut PipelineState) {
        let Some(projects) = &self.projects else {
            return;
        };
        let result = projects
            .mark_processing_started(state.project_id(), state.started_at().unwrap_or_else(Utc::now))
            .await;
        record_project_write(result, state);
    }

    async fn project_stage(&self, name: StageName, state: &mut PipelineState) {
        self.project_stage_label(name.as_str(), state).await;
    }

    async fn project_stage_label(&self, label: &str, state: &mut PipelineState) {
        let Some(projects) = &self.projects else {
            return;
        };
        let result = projects
            .update_stage(state.project_id(), ProjectStatus::Processing, label)
            .await;
        record_project_write(result, state);
    }

    async fn project_finished(&self, state: &mut PipelineState) {
        let Some(projects) = &self.projects else {
            return;
        };
        let status = if state.is_failed() {
            ProjectStatus::Failed
        } else {
            ProjectStatus::Completed
        };
        let first_error = state.errors().first().cloned();
        let result = projects
            .mark_processing_finished(state.project_id(), Utc::now(), status, first_error.as_deref())
            .await;
        record_project_write(result, state);
    }
}

/// Record a guard's verdict, once per message
fn record_verdict(route: Option<Route>, state: &mut PipelineState) {
    let Some(verdict) = route.and_then(|route| route.verdict) else {
        return;
    };
    match verdict {
        Verdict::Error(message) => {
            if !state.errors().contains(&message) {
                warn!(project_id = state.project_id(), "🛑 {}", message);
                state.record_error(message);
            }
        }
        Verdict::Warning(message) => {
            if !state.warnings().contains(&message) {
                warn!(project_id = state.project_id(), "{}", message);
                state.record_warning(message);
            }
        }
    }
}

fn record_project_write(result: PipelineResult<()>, state: &mut PipelineState) {
    if let Err(e) = result {
        warn!(project_id = state.project_id(), "⚠️ Failed to update project record: {}", e);
        state.record_warning(format!("Project record update failed: {}", e));
    }
}
