// Stages - Uniform stage contract plus adapters over the external collaborators
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::graph::{PipelineGraph, StageName};
use super::state::{PipelineState, StateUpdate};
use crate::config::{
    AudioConfig, CursorDetectionConfig, FrameExtractionConfig, RenderConfig, UserPreferences,
    VisionConfig,
};
use crate::error::{PipelineError, PipelineResult, StageError};
use crate::types::{
    CursorEvent, EditPlan, Frame, FrameDescription, Metered, NarrationScript, SilenceSegment,
    TimelineEvent, Transcript, Usage, VideoMetadata,
};

/// What a stage hands back to the orchestrator: an artifact patch and its cost
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub update: StateUpdate,
    pub usage: Usage,
}

impl StageOutput {
    pub fn new(update: StateUpdate, usage: Usage) -> Self {
        Self { update, usage }
    }
}

/// One unit of pipeline work. Stages read the state and never mutate it.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError>;
}

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VideoProber: Send + Sync {
    async fn probe(&self, video_path: &Path) -> Result<Metered<VideoMetadata>, StageError>;
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(
        &self,
        video_path: &Path,
        config: &FrameExtractionConfig,
    ) -> Result<Metered<Vec<Frame>>, StageError>;
}

#[async_trait]
pub trait CursorDetector: Send + Sync {
    async fn detect(
        &self,
        frames: &[Frame],
        config: &CursorDetectionConfig,
    ) -> Result<Metered<Vec<CursorEvent>>, StageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioAnalysis {
    pub transcript: Transcript,
    pub silence_segments: Vec<SilenceSegment>,
}

#[async_trait]
pub trait AudioProcessor: Send + Sync {
    async fn process(
        &self,
        video_path: &Path,
        config: &AudioConfig,
    ) -> Result<Metered<AudioAnalysis>, StageError>;
}

#[async_trait]
pub trait VisionDescriber: Send + Sync {
    async fn describe(
        &self,
        frames: &[Frame],
        cursor_events: &[CursorEvent],
        config: &VisionConfig,
    ) -> Result<Metered<Vec<FrameDescription>>, StageError>;
}

/// Everything the analysis collaborator correlates
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    pub cursor_events: &'a [CursorEvent],
    pub frame_descriptions: &'a [FrameDescription],
    pub transcript: Option<&'a Transcript>,
    pub silence_segments: &'a [SilenceSegment],
    pub metadata: Option<&'a VideoMetadata>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        input: AnalysisInput<'_>,
    ) -> Result<Metered<Vec<TimelineEvent>>, StageError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PlanningInput<'a> {
    pub event_timeline: &'a [TimelineEvent],
    pub transcript: Option<&'a Transcript>,
    pub metadata: Option<&'a VideoMetadata>,
    pub preferences: &'a UserPreferences,
}

/// A plan may legitimately come back without an edit plan
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptPlan {
    pub narration_script: Option<NarrationScript>,
    pub edit_plan: Option<EditPlan>,
}

#[async_trait]
pub trait ScriptPlanner: Send + Sync {
    async fn plan(&self, input: PlanningInput<'_>) -> Result<Metered<ScriptPlan>, StageError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Returns the path of the rendered video
    async fn render(
        &self,
        video_path: &Path,
        edit_plan: &EditPlan,
        narration: Option<&NarrationScript>,
        config: &RenderConfig,
    ) -> Result<Metered<String>, StageError>;
}

// ---------------------------------------------------------------------------
// Built-in stages
// ---------------------------------------------------------------------------

/// Checks the source video and probes its metadata when a prober is configured
#[derive(Default)]
pub struct IntakeStage {
    prober: Option<Arc<dyn VideoProber>>,
}

impl IntakeStage {
    pub fn new(prober: Option<Arc<dyn VideoProber>>) -> Self {
        Self { prober }
    }
}

#[async_trait]
impl Stage for IntakeStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let path = Path::new(state.video_path());
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(StageError::failed(format!("{} is not a file", path.display())));
        }
        if metadata.len() == 0 {
            return Err(StageError::failed(format!("{} is empty", path.display())));
        }

        let Some(prober) = &self.prober else {
            return Ok(StageOutput::default());
        };
        let probed = prober.probe(path).await?;
        debug!(
            project_id = state.project_id(),
            resolution = %probed.output.resolution(),
            duration = probed.output.duration_seconds,
            "Probed source video"
        );

        let update = StateUpdate {
            video_metadata: Some(probed.output),
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, probed.usage))
    }
}

/// Terminal stage. Reports what the run produced; finalization is done by the orchestrator.
pub struct OutputStage;

#[async_trait]
impl Stage for OutputStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        info!(
            project_id = state.project_id(),
            errors = state.errors().len(),
            warnings = state.warnings().len(),
            completed = state.completed_stages().len(),
            total_cost_usd = %state.total_cost_usd(),
            output = state.final_video_path.as_deref().unwrap_or("-"),
            "📦 Pipeline output ready"
        );
        Ok(StageOutput::default())
    }
}

// ---------------------------------------------------------------------------
// Collaborator adapters
// ---------------------------------------------------------------------------

pub struct FrameExtractionStage(pub Arc<dyn FrameExtractor>);

#[async_trait]
impl Stage for FrameExtractionStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let result = self
            .0
            .extract(
                Path::new(state.video_path()),
                &state.config().frame_extraction,
            )
            .await?;

        let mut update = StateUpdate::new();
        if result.output.is_empty() {
            update = update.with_warning("Frame extraction produced no frames");
        }
        update.frames = Some(result.output);
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct CursorDetectionStage(pub Arc<dyn CursorDetector>);

#[async_trait]
impl Stage for CursorDetectionStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        // Without frames there is nothing to detect; the outgoing guard reports it
        let frames = match state.frames.as_deref() {
            Some(frames) if !frames.is_empty() => frames,
            _ => {
                let update = StateUpdate {
                    cursor_events: Some(Vec::new()),
                    ..StateUpdate::new()
                };
                return Ok(StageOutput::new(
                    update.with_warning("Cursor detection skipped: no frames"),
                    Usage::default(),
                ));
            }
        };

        let result = self
            .0
            .detect(frames, &state.config().cursor_detection)
            .await?;
        let update = StateUpdate {
            cursor_events: Some(result.output),
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct AudioStage(pub Arc<dyn AudioProcessor>);

#[async_trait]
impl Stage for AudioStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let result = self
            .0
            .process(Path::new(state.video_path()), &state.config().audio)
            .await?;
        let AudioAnalysis {
            transcript,
            silence_segments,
        } = result.output;

        let mut update = StateUpdate::new();
        if transcript.text.trim().is_empty() {
            update = update.with_warning("No speech detected in audio track");
        }
        update.transcript = Some(transcript);
        update.silence_segments = Some(silence_segments);
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct VisionStage(pub Arc<dyn VisionDescriber>);

#[async_trait]
impl Stage for VisionStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let frames = state
            .frames
            .as_deref()
            .filter(|frames| !frames.is_empty())
            .ok_or(StageError::MissingInput("frames"))?;
        let cursor_events = state.cursor_events.as_deref().unwrap_or_default();

        let result = self
            .0
            .describe(frames, cursor_events, &state.config().vision)
            .await?;
        let update = StateUpdate {
            frame_descriptions: Some(result.output),
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct AnalysisStage(pub Arc<dyn Analyzer>);

#[async_trait]
impl Stage for AnalysisStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let frame_descriptions = state
            .frame_descriptions
            .as_deref()
            .filter(|descriptions| !descriptions.is_empty())
            .ok_or(StageError::MissingInput("frame_descriptions"))?;

        let input = AnalysisInput {
            cursor_events: state.cursor_events.as_deref().unwrap_or_default(),
            frame_descriptions,
            transcript: state.transcript.as_ref(),
            silence_segments: state.silence_segments.as_deref().unwrap_or_default(),
            metadata: state.video_metadata.as_ref(),
        };
        let result = self.0.analyze(input).await?;
        let update = StateUpdate {
            event_timeline: Some(result.output),
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct ScriptPlanningStage(pub Arc<dyn ScriptPlanner>);

#[async_trait]
impl Stage for ScriptPlanningStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let event_timeline = state
            .event_timeline
            .as_deref()
            .ok_or(StageError::MissingInput("event_timeline"))?;

        let input = PlanningInput {
            event_timeline,
            transcript: state.transcript.as_ref(),
            metadata: state.video_metadata.as_ref(),
            preferences: state.user_preferences(),
        };
        let result = self.0.plan(input).await?;
        let update = StateUpdate {
            narration_script: result.output.narration_script,
            edit_plan: result.output.edit_plan,
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, result.usage))
    }
}

pub struct RenderStage(pub Arc<dyn Renderer>);

#[async_trait]
impl Stage for RenderStage {
    async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
        let edit_plan = state
            .edit_plan
            .as_ref()
            .ok_or(StageError::MissingInput("edit_plan"))?;

        let result = self
            .0
            .render(
                Path::new(state.video_path()),
                edit_plan,
                state.narration_script.as_ref(),
                &state.config().render,
            )
            .await?;
        let update = StateUpdate {
            final_video_path: Some(result.output),
            ..StateUpdate::new()
        };
        Ok(StageOutput::new(update, result.usage))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps each stage name to the implementation that runs it
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageName, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in intake (without probing) and output stages
    pub fn with_builtins() -> Self {
        Self::new()
            .register(StageName::Intake, Arc::new(IntakeStage::default()))
            .register(StageName::Output, Arc::new(OutputStage))
    }

    /// Add or replace the stage for `name`
    pub fn register(mut self, name: StageName, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(name, stage);
        self
    }

    pub fn get(&self, name: StageName) -> Option<Arc<dyn Stage>> {
        self.stages.get(&name).cloned()
    }

    /// Every node of the graph must have a stage
    pub fn ensure_covers(&self, graph: &PipelineGraph) -> PipelineResult<()> {
        let missing: Vec<&str> = graph
            .nodes()
            .into_iter()
            .filter(|stage| !self.stages.contains_key(stage))
            .map(|stage| stage.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation(format!(
                "no stage registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

/// The full set of external collaborators a production run needs
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Option<Arc<dyn VideoProber>>,
    pub frame_extractor: Arc<dyn FrameExtractor>,
    pub cursor_detector: Arc<dyn CursorDetector>,
    pub audio_processor: Arc<dyn AudioProcessor>,
    pub vision_describer: Arc<dyn VisionDescriber>,
    pub analyzer: Arc<dyn Analyzer>,
    pub script_planner: Arc<dyn ScriptPlanner>,
    pub renderer: Arc<dyn Renderer>,
}

impl Collaborators {
    pub fn into_registry(self) -> StageRegistry {
        StageRegistry::new()
            .register(StageName::Intake, Arc::new(IntakeStage::new(self.prober)))
            .register(
                StageName::FrameExtractor,
                Arc::new(FrameExtractionStage(self.frame_extractor)),
            )
            .register(
                StageName::CursorDetector,
                Arc::new(CursorDetectionStage(self.cursor_detector)),
            )
            .register(StageName::AudioAgent, Arc::new(AudioStage(self.audio_processor)))
            .register(
                StageName::VisionDescription,
                Arc::new(VisionStage(self.vision_describer)),
            )
            .register(StageName::AnalysisAgent, Arc::new(AnalysisStage(self.analyzer)))
            .register(
                StageName::ScriptPlanner,
                Arc::new(ScriptPlanningStage(self.script_planner)),
            )
            .register(StageName::Render, Arc::new(RenderStage(self.renderer)))
            .register(StageName::Output, Arc::new(OutputStage))
    }
}

/// Scriptable stages for exercising the orchestrator
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::pricing::ModelPricing;
    use crate::types::{
        CursorEventKind, EditOperation, NarrationSegment, TranscriptSegment,
    };
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Behavior = Box<dyn Fn(&PipelineState) -> Result<StageOutput, StageError> + Send + Sync>;

    pub struct ScriptedStage {
        calls: AtomicUsize,
        behavior: Behavior,
    }

    impl ScriptedStage {
        pub fn new<F>(behavior: F) -> Arc<Self>
        where
            F: Fn(&PipelineState) -> Result<StageOutput, StageError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behavior: Box::new(behavior),
            })
        }

        pub fn failing(message: &'static str) -> Arc<Self> {
            Self::new(move |_| Err(StageError::failed(message)))
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Stage for ScriptedStage {
        async fn run(&self, state: &PipelineState) -> Result<StageOutput, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behavior)(state)
        }
    }

    pub fn metered(update: StateUpdate, tokens: i64, cents: i64) -> Result<StageOutput, StageError> {
        Ok(StageOutput::new(update, Usage::new(tokens, Decimal::new(cents, 2))))
    }

    pub fn frames(n: u32) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame {
                index: i,
                timestamp: f64::from(i) * 0.5,
                path: format!("frames/{:04}.jpg", i),
            })
            .collect()
    }

    pub fn edit_plan() -> EditPlan {
        EditPlan {
            operations: vec![EditOperation::Cut { start: 1.0, end: 2.0 }],
        }
    }

    /// Default successful behavior for each stage of the standard graph
    pub fn happy_stage(name: StageName) -> Arc<ScriptedStage> {
        match name {
            StageName::Intake => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        video_metadata: Some(VideoMetadata {
                            duration_seconds: 12.0,
                            file_size_mb: 4.2,
                            width: 1920,
                            height: 1080,
                            fps: 30.0,
                            codec: Some("h264".to_string()),
                        }),
                        ..StateUpdate::new()
                    },
                    0,
                    0,
                )
            }),
            StageName::FrameExtractor => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        frames: Some(frames(4)),
                        ..StateUpdate::new()
                    },
                    0,
                    0,
                )
            }),
            StageName::CursorDetector => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        cursor_events: Some(vec![CursorEvent {
                            timestamp: 0.5,
                            x: 640.0,
                            y: 360.0,
                            kind: CursorEventKind::Click,
                            confidence: 0.9,
                        }]),
                        ..StateUpdate::new()
                    },
                    0,
                    0,
                )
            }),
            StageName::AudioAgent => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        transcript: Some(Transcript {
                            text: "Click save".to_string(),
                            language: Some("en".to_string()),
                            segments: vec![TranscriptSegment {
                                start: 0.0,
                                end: 1.0,
                                text: "Click save".to_string(),
                            }],
                        }),
                        silence_segments: Some(vec![SilenceSegment { start: 1.0, end: 2.0 }]),
                        ..StateUpdate::new()
                    },
                    200,
                    2,
                )
            }),
            StageName::VisionDescription => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        frame_descriptions: Some(vec![FrameDescription {
                            frame_index: 0,
                            timestamp: 0.0,
                            description: "Editor with save button".to_string(),
                        }]),
                        ..StateUpdate::new()
                    },
                    1000,
                    25,
                )
            }),
            StageName::AnalysisAgent => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        event_timeline: Some(vec![TimelineEvent {
                            start: 0.0,
                            end: 1.0,
                            kind: "click".to_string(),
                            description: "User saves the document".to_string(),
                        }]),
                        ..StateUpdate::new()
                    },
                    500,
                    10,
                )
            }),
            StageName::ScriptPlanner => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        narration_script: Some(NarrationScript {
                            style: "professional".to_string(),
                            segments: vec![NarrationSegment {
                                start: 0.0,
                                text: "Save your work.".to_string(),
                            }],
                        }),
                        edit_plan: Some(edit_plan()),
                        ..StateUpdate::new()
                    },
                    800,
                    15,
                )
            }),
            StageName::Render => ScriptedStage::new(|_| {
                metered(
                    StateUpdate {
                        final_video_path: Some("projects/p1/output/final.mp4".to_string()),
                        ..StateUpdate::new()
                    },
                    0,
                    0,
                )
            }),
            StageName::Output => ScriptedStage::new(|_| Ok(StageOutput::default())),
        }
    }

    /// One fake standing in for every external collaborator
    pub struct FakeStudio;

    #[async_trait]
    impl FrameExtractor for FakeStudio {
        async fn extract(
            &self,
            _video_path: &Path,
            config: &FrameExtractionConfig,
        ) -> Result<Metered<Vec<Frame>>, StageError> {
            Ok(Metered::free(frames(config.max_frames.min(3))))
        }
    }

    #[async_trait]
    impl CursorDetector for FakeStudio {
        async fn detect(
            &self,
            frames: &[Frame],
            _config: &CursorDetectionConfig,
        ) -> Result<Metered<Vec<CursorEvent>>, StageError> {
            let events = frames
                .iter()
                .map(|frame| CursorEvent {
                    timestamp: frame.timestamp,
                    x: 100.0,
                    y: 200.0,
                    kind: CursorEventKind::Move,
                    confidence: 0.8,
                })
                .collect();
            Ok(Metered::free(events))
        }
    }

    #[async_trait]
    impl AudioProcessor for FakeStudio {
        async fn process(
            &self,
            _video_path: &Path,
            _config: &AudioConfig,
        ) -> Result<Metered<AudioAnalysis>, StageError> {
            let minutes = Decimal::new(5, 1);
            Ok(Metered::with_usage(
                AudioAnalysis {
                    transcript: Transcript {
                        text: "Open the settings page".to_string(),
                        language: Some("en".to_string()),
                        segments: Vec::new(),
                    },
                    silence_segments: Vec::new(),
                },
                Usage::new(0, crate::pricing::whisper_cost(minutes)),
            ))
        }
    }

    #[async_trait]
    impl VisionDescriber for FakeStudio {
        async fn describe(
            &self,
            frames: &[Frame],
            _cursor_events: &[CursorEvent],
            _config: &VisionConfig,
        ) -> Result<Metered<Vec<FrameDescription>>, StageError> {
            let descriptions = frames
                .iter()
                .map(|frame| FrameDescription {
                    frame_index: frame.index,
                    timestamp: frame.timestamp,
                    description: format!("Settings page, frame {}", frame.index),
                })
                .collect();
            Ok(Metered::with_usage(
                descriptions,
                ModelPricing::gpt_4o().usage(1000, 500),
            ))
        }
    }

    #[async_trait]
    impl Analyzer for FakeStudio {
        async fn analyze(
            &self,
            input: AnalysisInput<'_>,
        ) -> Result<Metered<Vec<TimelineEvent>>, StageError> {
            let events = input
                .frame_descriptions
                .iter()
                .map(|d| TimelineEvent {
                    start: d.timestamp,
                    end: d.timestamp + 0.5,
                    kind: "navigation".to_string(),
                    description: d.description.clone(),
                })
                .collect();
            Ok(Metered::free(events))
        }
    }

    #[async_trait]
    impl ScriptPlanner for FakeStudio {
        async fn plan(&self, input: PlanningInput<'_>) -> Result<Metered<ScriptPlan>, StageError> {
            Ok(Metered::free(ScriptPlan {
                narration_script: Some(NarrationScript {
                    style: input.preferences.narration_style.clone(),
                    segments: vec![NarrationSegment {
                        start: 0.0,
                        text: "Open the settings page.".to_string(),
                    }],
                }),
                edit_plan: Some(edit_plan()),
            }))
        }
    }

    #[async_trait]
    impl Renderer for FakeStudio {
        async fn render(
            &self,
            video_path: &Path,
            _edit_plan: &EditPlan,
            _narration: Option<&NarrationScript>,
            _config: &RenderConfig,
        ) -> Result<Metered<String>, StageError> {
            Ok(Metered::free(
                video_path.with_extension("final.mp4").to_string_lossy().into_owned(),
            ))
        }
    }

    pub fn fake_collaborators() -> Collaborators {
        let studio = Arc::new(FakeStudio);
        Collaborators {
            prober: None,
            frame_extractor: studio.clone(),
            cursor_detector: studio.clone(),
            audio_processor: studio.clone(),
            vision_describer: studio.clone(),
            analyzer: studio.clone(),
            script_planner: studio.clone(),
            renderer: studio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::types::{CursorEventKind, EditOperation};
    use uuid::Uuid;

    struct StubExtractor(u32);

    #[async_trait]
    impl FrameExtractor for StubExtractor {
        async fn extract(
            &self,
            _video_path: &Path,
            config: &FrameExtractionConfig,
        ) -> Result<Metered<Vec<Frame>>, StageError> {
            let count = self.0.min(config.max_frames);
            Ok(Metered::free(testing::frames(count)))
        }
    }

    struct StubDetector;

    #[async_trait]
    impl CursorDetector for StubDetector {
        async fn detect(
            &self,
            frames: &[Frame],
            _config: &CursorDetectionConfig,
        ) -> Result<Metered<Vec<CursorEvent>>, StageError> {
            Ok(Metered::free(
                frames
                    .iter()
                    .map(|f| CursorEvent {
                        timestamp: f.timestamp,
                        x: 10.0,
                        y: 20.0,
                        kind: CursorEventKind::Move,
                        confidence: 0.8,
                    })
                    .collect(),
            ))
        }
    }

    struct StubPlanner {
        with_plan: bool,
    }

    #[async_trait]
    impl ScriptPlanner for StubPlanner {
        async fn plan(&self, input: PlanningInput<'_>) -> Result<Metered<ScriptPlan>, StageError> {
            let edit_plan = self.with_plan.then(|| EditPlan {
                operations: input
                    .event_timeline
                    .iter()
                    .map(|e| EditOperation::Highlight {
                        start: e.start,
                        end: e.end,
                        x: 0.0,
                        y: 0.0,
                    })
                    .collect(),
            });
            Ok(Metered::with_usage(
                ScriptPlan {
                    narration_script: None,
                    edit_plan,
                },
                Usage::new(42, rust_decimal::Decimal::new(3, 2)),
            ))
        }
    }

    fn state() -> PipelineState {
        PipelineState::create(
            "p1",
            "/videos/demo.mp4",
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_frame_extraction_warns_on_zero_frames() {
        let stage = FrameExtractionStage(Arc::new(StubExtractor(0)));
        let output = stage.run(&state()).await.unwrap();
        assert_eq!(output.update.frames, Some(Vec::new()));
        assert_eq!(output.update.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_detection_without_frames_yields_no_events() {
        let stage = CursorDetectionStage(Arc::new(StubDetector));
        let output = stage.run(&state()).await.unwrap();
        assert_eq!(output.update.cursor_events, Some(Vec::new()));

        let mut s = state();
        s.frames = Some(testing::frames(3));
        let output = stage.run(&s).await.unwrap();
        assert_eq!(output.update.cursor_events.map(|e| e.len()), Some(3));
    }

    #[tokio::test]
    async fn test_planner_may_omit_edit_plan() {
        let mut s = state();
        s.event_timeline = Some(Vec::new());

        let output = ScriptPlanningStage(Arc::new(StubPlanner { with_plan: false }))
            .run(&s)
            .await
            .unwrap();
        assert!(output.update.edit_plan.is_none());
        assert_eq!(output.usage.tokens, 42);

        let output = ScriptPlanningStage(Arc::new(StubPlanner { with_plan: true }))
            .run(&s)
            .await
            .unwrap();
        assert!(output.update.edit_plan.is_some());
    }

    #[tokio::test]
    async fn test_planner_requires_timeline() {
        let err = ScriptPlanningStage(Arc::new(StubPlanner { with_plan: true }))
            .run(&state())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput("event_timeline")));
    }

    #[tokio::test]
    async fn test_intake_rejects_missing_and_empty_files() {
        let err = IntakeStage::default().run(&state()).await.unwrap_err();
        assert!(matches!(err, StageError::Io(_)));

        let dir = std::env::temp_dir().join(format!("intake-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let empty = dir.join("empty.mp4");
        tokio::fs::write(&empty, b"").await.unwrap();
        let s = PipelineState::create(
            "p1",
            empty.to_string_lossy(),
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap();
        assert!(matches!(
            IntakeStage::default().run(&s).await,
            Err(StageError::Failed(_))
        ));

        let video = dir.join("demo.mp4");
        tokio::fs::write(&video, b"not really a video").await.unwrap();
        let s = PipelineState::create(
            "p1",
            video.to_string_lossy(),
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap();
        assert_eq!(IntakeStage::default().run(&s).await.unwrap(), StageOutput::default());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_registry_must_cover_graph() {
        let graph = PipelineGraph::standard().unwrap();
        let err = StageRegistry::with_builtins().ensure_covers(&graph).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(msg) if msg.contains("frame_extractor")));

        let full = StageName::ALL
            .iter()
            .fold(StageRegistry::new(), |registry, name| {
                registry.register(*name, testing::happy_stage(*name))
            });
        assert!(full.ensure_covers(&graph).is_ok());
    }
}
