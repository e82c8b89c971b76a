// PipelineState - The single mutable record threaded through every stage
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::graph::StageName;
use crate::config::{PipelineConfig, UserPreferences};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    CursorEvent, EditPlan, Frame, FrameDescription, NarrationScript, SilenceSegment,
    TimelineEvent, Transcript, Usage, VideoMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Created,
    Running,
    Error,
    Complete,
}

/// State of one pipeline run.
///
/// Inputs are fixed at creation. Artifacts are public because stages read
/// them directly; bookkeeping (status, errors, warnings, completed stages,
/// totals) only changes through the methods below so its invariants hold:
/// errors and warnings are append-only, a stage completes at most once,
/// totals never decrease, and `Error` is never left once entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    project_id: String,
    video_path: String,
    config: PipelineConfig,
    user_preferences: UserPreferences,

    status: PipelineStatus,

    pub video_metadata: Option<VideoMetadata>,
    pub frames: Option<Vec<Frame>>,
    pub cursor_events: Option<Vec<CursorEvent>>,
    pub frame_descriptions: Option<Vec<FrameDescription>>,
    pub transcript: Option<Transcript>,
    pub silence_segments: Option<Vec<SilenceSegment>>,
    pub event_timeline: Option<Vec<TimelineEvent>>,
    pub narration_script: Option<NarrationScript>,
    pub edit_plan: Option<EditPlan>,
    pub final_video_path: Option<String>,

    errors: Vec<String>,
    warnings: Vec<String>,
    completed_stages: Vec<StageName>,

    total_cost_usd: Decimal,
    total_tokens: i64,

    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    /// Wall-clock seconds, set once by the output stage
    processing_time: Option<f64>,
}

impl PipelineState {
    pub fn create(
        project_id: impl Into<String>,
        video_path: impl Into<String>,
        config: PipelineConfig,
        user_preferences: UserPreferences,
    ) -> PipelineResult<Self> {
        let project_id = project_id.into();
        let video_path = video_path.into();

        if project_id.trim().is_empty() {
            return Err(PipelineError::Validation("project_id must not be empty".to_string()));
        }
        if video_path.trim().is_empty() {
            return Err(PipelineError::Validation("video_path must not be empty".to_string()));
        }

        Ok(Self {
            project_id,
            video_path,
            config,
            user_preferences,
            status: PipelineStatus::Created,
            video_metadata: None,
            frames: None,
            cursor_events: None,
            frame_descriptions: None,
            transcript: None,
            silence_segments: None,
            event_timeline: None,
            narration_script: None,
            edit_plan: None,
            final_video_path: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            completed_stages: Vec::new(),
            total_cost_usd: Decimal::ZERO,
            total_tokens: 0,
            created_at: Utc::now(),
            started_at: None,
            processing_time: None,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn video_path(&self) -> &str {
        &self.video_path
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn user_preferences(&self) -> &UserPreferences {
        &self.user_preferences
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn completed_stages(&self) -> &[StageName] {
        &self.completed_stages
    }

    pub fn total_cost_usd(&self) -> Decimal {
        self.total_cost_usd
    }

    pub fn total_tokens(&self) -> i64 {
        self.total_tokens
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn processing_time(&self) -> Option<f64> {
        self.processing_time
    }

    pub fn is_failed(&self) -> bool {
        self.status == PipelineStatus::Error
    }

    /// True once `finalize` ran. A failed run is not finished until the
    /// output stage has closed it.
    pub fn is_finished(&self) -> bool {
        self.processing_time.is_some()
    }

    pub fn is_stage_complete(&self, stage: StageName) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// created -> running. A resumed run keeps its original start time.
    pub fn begin_run(&mut self) {
        if self.status == PipelineStatus::Created {
            self.status = PipelineStatus::Running;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Idempotent so that a resumed run never lists a stage twice
    pub fn mark_stage_complete(&mut self, stage: StageName) {
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
    }

    /// Irreversible within the run
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.status = PipelineStatus::Error;
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn accumulate_cost(&mut self, tokens: i64, usd: Decimal) -> PipelineResult<()> {
        if tokens < 0 || usd.is_sign_negative() {
            return Err(PipelineError::InvalidCost { tokens, usd });
        }
        self.total_tokens += tokens;
        self.total_cost_usd += usd;
        Ok(())
    }

    pub fn accumulate_usage(&mut self, usage: Usage) -> PipelineResult<()> {
        self.accumulate_cost(usage.tokens, usage.cost_usd)
    }

    /// Set `processing_time` once and close the run.
    ///
    /// Status becomes `Complete` unless an error was recorded.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if self.processing_time.is_none() {
            let started = self.started_at.unwrap_or(self.created_at);
            let elapsed_ms = (now - started).num_milliseconds().max(0);
            self.processing_time = Some(elapsed_ms as f64 / 1000.0);
        }
        if self.status != PipelineStatus::Error {
            self.status = PipelineStatus::Complete;
        }
    }
}

/// Artifact patch returned by a stage; applied by the single writer.
///
/// Each stage fills only the fields it produces, so updates from the two
/// fan-out branches touch disjoint artifacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub video_metadata: Option<VideoMetadata>,
    pub frames: Option<Vec<Frame>>,
    pub cursor_events: Option<Vec<CursorEvent>>,
    pub frame_descriptions: Option<Vec<FrameDescription>>,
    pub transcript: Option<Transcript>,
    pub silence_segments: Option<Vec<SilenceSegment>>,
    pub event_timeline: Option<Vec<TimelineEvent>>,
    pub narration_script: Option<NarrationScript>,
    pub edit_plan: Option<EditPlan>,
    pub final_video_path: Option<String>,
    pub warnings: Vec<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    pub fn apply(self, state: &mut PipelineState) {
        if let Some(metadata) = self.video_metadata {
            state.video_metadata = Some(metadata);
        }
        if let Some(frames) = self.frames {
            state.frames = Some(frames);
        }
        if let Some(events) = self.cursor_events {
            state.cursor_events = Some(events);
        }
        if let Some(descriptions) = self.frame_descriptions {
            state.frame_descriptions = Some(descriptions);
        }
        if let Some(transcript) = self.transcript {
            state.transcript = Some(transcript);
        }
        if let Some(segments) = self.silence_segments {
            state.silence_segments = Some(segments);
        }
        if let Some(timeline) = self.event_timeline {
            state.event_timeline = Some(timeline);
        }
        if let Some(script) = self.narration_script {
            state.narration_script = Some(script);
        }
        if let Some(plan) = self.edit_plan {
            state.edit_plan = Some(plan);
        }
        if let Some(path) = self.final_video_path {
            state.final_video_path = Some(path);
        }
        for warning in self.warnings {
            state.record_warning(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state() -> PipelineState {
        PipelineState::create(
            "project-1",
            "/videos/demo.mp4",
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_initializes_empty_state() {
        let s = state();
        assert_eq!(s.status(), PipelineStatus::Created);
        assert!(s.frames.is_none());
        assert!(s.final_video_path.is_none());
        assert!(s.errors().is_empty());
        assert!(s.warnings().is_empty());
        assert!(s.completed_stages().is_empty());
        assert_eq!(s.total_cost_usd(), Decimal::ZERO);
        assert_eq!(s.total_tokens(), 0);
        assert!(s.processing_time().is_none());
    }

    #[test]
    fn test_create_rejects_empty_inputs() {
        let err = PipelineState::create("", "/v.mp4", PipelineConfig::default(), UserPreferences::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = PipelineState::create("p", "  ", PipelineConfig::default(), UserPreferences::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_mark_stage_complete_is_idempotent() {
        let mut s = state();
        s.mark_stage_complete(StageName::Intake);
        s.mark_stage_complete(StageName::FrameExtractor);
        s.mark_stage_complete(StageName::Intake);
        assert_eq!(
            s.completed_stages(),
            &[StageName::Intake, StageName::FrameExtractor]
        );
    }

    #[test]
    fn test_record_error_is_irreversible() {
        let mut s = state();
        s.begin_run();
        s.record_error("frame_extractor failed: ffmpeg exited with 1");
        assert_eq!(s.status(), PipelineStatus::Error);

        s.begin_run();
        s.finalize(Utc::now());
        assert_eq!(s.status(), PipelineStatus::Error);
        assert_eq!(s.errors().len(), 1);
    }

    #[test]
    fn test_record_warning_keeps_status() {
        let mut s = state();
        s.begin_run();
        s.record_warning("no speech detected");
        assert_eq!(s.status(), PipelineStatus::Running);
        assert_eq!(s.warnings(), &["no speech detected".to_string()]);
    }

    #[test]
    fn test_accumulate_cost_rejects_negative_inputs() {
        let mut s = state();
        s.accumulate_cost(1200, Decimal::new(125, 2)).unwrap();
        s.accumulate_cost(300, Decimal::new(25, 2)).unwrap();

        assert!(matches!(
            s.accumulate_cost(-1, Decimal::ZERO),
            Err(PipelineError::InvalidCost { .. })
        ));
        assert!(matches!(
            s.accumulate_cost(10, Decimal::new(-1, 2)),
            Err(PipelineError::InvalidCost { .. })
        ));

        assert_eq!(s.total_tokens(), 1500);
        assert_eq!(s.total_cost_usd(), Decimal::new(150, 2));
    }

    #[test]
    fn test_finalize_sets_processing_time_once() {
        let mut s = state();
        s.begin_run();
        let started = s.started_at().unwrap();

        assert!(!s.is_finished());
        s.finalize(started + Duration::milliseconds(2500));
        assert!(s.is_finished());
        assert_eq!(s.processing_time(), Some(2.5));
        assert_eq!(s.status(), PipelineStatus::Complete);

        s.finalize(started + Duration::seconds(10));
        assert_eq!(s.processing_time(), Some(2.5));
    }

    #[test]
    fn test_update_applies_only_produced_fields() {
        let mut s = state();
        s.final_video_path = Some("out.mp4".to_string());

        StateUpdate {
            frames: Some(vec![Frame {
                index: 0,
                timestamp: 0.0,
                path: "f0.jpg".to_string(),
            }]),
            ..StateUpdate::new()
        }
        .with_warning("low frame count")
        .apply(&mut s);

        assert_eq!(s.frames.as_ref().map(Vec::len), Some(1));
        assert_eq!(s.final_video_path.as_deref(), Some("out.mp4"));
        assert_eq!(s.warnings(), &["low frame count".to_string()]);
    }
}
