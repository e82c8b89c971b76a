// Executor - Runs a single stage under the ledger contract
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::graph::StageName;
use super::stages::{Stage, StageOutput};
use super::state::PipelineState;
use crate::error::{PipelineError, StageError};
use crate::ledger::{LedgerEntryId, NewLedgerEntry, StageLedger};

/// Result of one stage invocation, not yet applied to the state
#[derive(Debug)]
pub struct StageOutcome {
    pub stage: StageName,
    pub result: Result<StageOutput, String>,
    /// Ledger writes that failed; recorded as warnings
    pub ledger_warnings: Vec<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Fold the outcome into the state (the single writer)
    pub fn apply(self, state: &mut PipelineState) {
        for warning in self.ledger_warnings {
            state.record_warning(warning);
        }

        match self.result {
            Ok(output) => {
                output.update.apply(state);
                state.mark_stage_complete(self.stage);
                if let Err(e) = state.accumulate_usage(output.usage) {
                    state.record_error(
                        PipelineError::StageFailure {
                            stage: self.stage,
                            message: e.to_string(),
                        }
                        .to_string(),
                    );
                }
            }
            Err(message) => state.record_error(message),
        }
    }
}

/// Executes stages exactly once each, recording every invocation in the ledger.
///
/// Failures come back as values; a stage never aborts the run by itself.
#[derive(Clone)]
pub struct StageExecutor {
    ledger: Arc<dyn StageLedger>,
    stage_timeout: Option<Duration>,
}

impl StageExecutor {
    pub fn new(ledger: Arc<dyn StageLedger>) -> Self {
        Self {
            ledger,
            stage_timeout: None,
        }
    }

    /// Treat stages that run longer than `limit` as failed
    pub fn with_stage_timeout(mut self, limit: Duration) -> Self {
        self.stage_timeout = Some(limit);
        self
    }

    pub fn ledger(&self) -> Arc<dyn StageLedger> {
        self.ledger.clone()
    }

    pub async fn execute(
        &self,
        name: StageName,
        stage: &dyn Stage,
        state: &PipelineState,
    ) -> StageOutcome {
        let project_id = state.project_id();
        let mut ledger_warnings = Vec::new();

        let entry_id = match self
            .ledger
            .append(NewLedgerEntry {
                project_id: project_id.to_string(),
                stage_name: name,
                start_time: Utc::now(),
            })
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(project_id, stage = %name, "⚠️ Failed to record stage start: {}", e);
                ledger_warnings.push(ledger_warning(name, &e));
                None
            }
        };

        info!(project_id, stage = %name, "▶️ Stage started");
        let started = Instant::now();

        let result = match self.invoke(stage, state).await {
            Ok(output) if !output.usage.is_valid() => Err(PipelineError::StageFailure {
                stage: name,
                message: PipelineError::InvalidCost {
                    tokens: output.usage.tokens,
                    usd: output.usage.cost_usd,
                }
                .to_string(),
            }
            .to_string()),
            Ok(output) => Ok(output),
            Err(e) => Err(failure_message(name, e)),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(output) => {
                info!(
                    project_id,
                    stage = %name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    tokens = output.usage.tokens,
                    cost_usd = %output.usage.cost_usd,
                    "✅ Stage completed"
                );
            }
            Err(message) => {
                error!(project_id, stage = %name, elapsed_ms = elapsed.as_millis() as u64, "❌ {}", message);
            }
        }

        if let Some(id) = entry_id {
            if let Err(e) = self.close_entry(id, &result).await {
                warn!(project_id, stage = %name, "⚠️ Failed to record stage end: {}", e);
                ledger_warnings.push(ledger_warning(name, &e));
            }
        }

        StageOutcome {
            stage: name,
            result,
            ledger_warnings,
        }
    }

    async fn invoke(
        &self,
        stage: &dyn Stage,
        state: &PipelineState,
    ) -> Result<StageOutput, StageError> {
        match self.stage_timeout {
            Some(limit) => match timeout(limit, stage.run(state)).await {
                Ok(result) => result,
                Err(_) => Err(StageError::TimedOut(limit)),
            },
            None => stage.run(state).await,
        }
    }

    async fn close_entry(
        &self,
        id: LedgerEntryId,
        result: &Result<StageOutput, String>,
    ) -> Result<(), PipelineError> {
        let end_time = Utc::now();
        match result {
            Ok(output) => self.ledger.complete(id, end_time, output.usage).await,
            Err(message) => self.ledger.fail(id, end_time, message).await,
        }
    }
}

fn failure_message(stage: StageName, error: StageError) -> String {
    match error {
        StageError::MissingInput(artifact) => {
            PipelineError::MissingArtifact { stage, artifact }.to_string()
        }
        other => PipelineError::StageFailure {
            stage,
            message: other.to_string(),
        }
        .to_string(),
    }
}

fn ledger_warning(stage: StageName, error: &PipelineError) -> String {
    format!("Stage ledger write failed for '{}': {}", stage, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, UserPreferences};
    use crate::ledger::{LedgerEntry, LedgerFilter, LedgerStatus};
    use crate::storage::memory::MemoryStore;
    use crate::types::Usage;
    use crate::workflow::stages::testing::{self, ScriptedStage};
    use crate::workflow::state::{PipelineStatus, StateUpdate};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal::Decimal;

    fn state() -> PipelineState {
        let mut s = PipelineState::create(
            "p1",
            "/videos/demo.mp4",
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap();
        s.begin_run();
        s
    }

    /// Ledger whose every write fails
    struct BrokenLedger;

    #[async_trait]
    impl StageLedger for BrokenLedger {
        async fn append(&self, _entry: NewLedgerEntry) -> crate::error::PipelineResult<LedgerEntryId> {
            Err(PipelineError::Storage("connection refused".to_string()))
        }

        async fn complete(
            &self,
            _id: LedgerEntryId,
            _end_time: DateTime<Utc>,
            _usage: Usage,
        ) -> crate::error::PipelineResult<()> {
            Err(PipelineError::Storage("connection refused".to_string()))
        }

        async fn fail(
            &self,
            _id: LedgerEntryId,
            _end_time: DateTime<Utc>,
            _error_message: &str,
        ) -> crate::error::PipelineResult<()> {
            Err(PipelineError::Storage("connection refused".to_string()))
        }

        async fn query(&self, _filter: &LedgerFilter) -> crate::error::PipelineResult<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_success_completes_ledger_and_state() {
        let ledger = Arc::new(MemoryStore::new());
        let executor = StageExecutor::new(ledger.clone());
        let stage = testing::happy_stage(StageName::VisionDescription);
        let mut s = state();

        let outcome = executor
            .execute(StageName::VisionDescription, stage.as_ref(), &s)
            .await;
        assert!(outcome.succeeded());
        outcome.apply(&mut s);

        assert_eq!(stage.calls(), 1);
        assert!(s.is_stage_complete(StageName::VisionDescription));
        assert!(s.frame_descriptions.is_some());
        assert_eq!(s.total_tokens(), 1000);
        assert_eq!(s.total_cost_usd(), Decimal::new(25, 2));

        let entries = ledger.stages_for("p1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LedgerStatus::Completed);
        assert_eq!(entries[0].tokens_used, 1000);
        assert!(entries[0].duration_seconds.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_a_value_with_stage_name() {
        let ledger = Arc::new(MemoryStore::new());
        let executor = StageExecutor::new(ledger.clone());
        let stage = ScriptedStage::failing("ffmpeg exited with status 1");
        let mut s = state();

        let outcome = executor.execute(StageName::FrameExtractor, stage.as_ref(), &s).await;
        assert!(!outcome.succeeded());
        outcome.apply(&mut s);

        assert_eq!(s.status(), PipelineStatus::Error);
        assert!(s.errors()[0].contains("frame_extractor"));
        assert!(s.errors()[0].contains("ffmpeg exited with status 1"));
        assert!(s.completed_stages().is_empty());

        let entries = ledger.stages_for("p1").await.unwrap();
        assert_eq!(entries[0].status, LedgerStatus::Failed);
        assert_eq!(entries[0].error_message.as_deref(), Some(s.errors()[0].as_str()));
    }

    #[tokio::test]
    async fn test_missing_input_reports_missing_artifact() {
        let executor = StageExecutor::new(Arc::new(MemoryStore::new()));
        let stage = ScriptedStage::new(|_| Err(StageError::MissingInput("edit_plan")));
        let mut s = state();

        executor
            .execute(StageName::Render, stage.as_ref(), &s)
            .await
            .apply(&mut s);
        assert!(s.errors()[0].contains("Missing artifact 'edit_plan'"));
    }

    #[tokio::test]
    async fn test_negative_usage_fails_the_stage() {
        let executor = StageExecutor::new(Arc::new(MemoryStore::new()));
        let stage = ScriptedStage::new(|_| testing::metered(StateUpdate::new(), -5, 0));
        let mut s = state();

        executor
            .execute(StageName::AnalysisAgent, stage.as_ref(), &s)
            .await
            .apply(&mut s);
        assert!(s.is_failed());
        assert_eq!(s.total_tokens(), 0);
        assert!(!s.is_stage_complete(StageName::AnalysisAgent));
    }

    #[tokio::test]
    async fn test_ledger_outage_degrades_to_warning() {
        let executor = StageExecutor::new(Arc::new(BrokenLedger));
        let stage = testing::happy_stage(StageName::FrameExtractor);
        let mut s = state();

        executor
            .execute(StageName::FrameExtractor, stage.as_ref(), &s)
            .await
            .apply(&mut s);

        assert_eq!(s.status(), PipelineStatus::Running);
        assert!(s.is_stage_complete(StageName::FrameExtractor));
        assert_eq!(s.warnings().len(), 1);
        assert!(s.warnings()[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn test_stage_timeout_fails_the_stage() {
        struct Slow;

        #[async_trait]
        impl Stage for Slow {
            async fn run(&self, _state: &PipelineState) -> Result<StageOutput, StageError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StageOutput::default())
            }
        }

        let executor = StageExecutor::new(Arc::new(MemoryStore::new()))
            .with_stage_timeout(Duration::from_millis(20));
        let mut s = state();
        executor
            .execute(StageName::Render, &Slow, &s)
            .await
            .apply(&mut s);

        assert!(s.is_failed());
        assert!(s.errors()[0].contains("timed out"));
    }
}
