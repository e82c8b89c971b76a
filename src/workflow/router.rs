// Router - Guards for the conditional edges of the pipeline graph
use std::sync::Arc;

use super::graph::StageName;
use super::state::PipelineState;

/// Guard function - decides the next stage from the current state
pub type RouterFunction = Arc<dyn Fn(&PipelineState) -> Route + Send + Sync>;

/// Side effect a guard asks the orchestrator to record
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Unrecoverable: recorded with `record_error`
    Error(String),
    /// Soft failure: recorded with `record_warning`
    Warning(String),
}

/// Routing decision produced by a guard
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub next: StageName,
    pub verdict: Option<Verdict>,
}

impl Route {
    pub fn to(next: StageName) -> Self {
        Self { next, verdict: None }
    }
}

pub const FRAME_EXTRACTION_FAILED: &str = "Frame extraction failed: no frames available";
pub const VISION_ANALYSIS_FAILED: &str = "Vision analysis failed: no frame descriptions available";
pub const EDIT_PLAN_MISSING: &str = "Edit plan missing, skipping render";

/// cursor_detector -> vision_description, or output when frames are absent
pub fn after_cursor_detection() -> RouterFunction {
    RouterBuilder::new()
        .when(conditions::has_failed, StageName::Output)
        .when_with(
            |state| !conditions::has_frames(state),
            StageName::Output,
            Verdict::Error(FRAME_EXTRACTION_FAILED.to_string()),
        )
        .otherwise(StageName::VisionDescription)
        .build()
}

/// vision_description -> analysis_agent, or output when descriptions are absent
pub fn after_vision_description() -> RouterFunction {
    RouterBuilder::new()
        .when(conditions::has_failed, StageName::Output)
        .when_with(
            |state| !conditions::has_frame_descriptions(state),
            StageName::Output,
            Verdict::Error(VISION_ANALYSIS_FAILED.to_string()),
        )
        .otherwise(StageName::AnalysisAgent)
        .build()
}

/// script_planner -> render, or output (with a warning) when no edit plan exists
pub fn before_render() -> RouterFunction {
    RouterBuilder::new()
        .when(conditions::has_failed, StageName::Output)
        .when_with(
            |state| !conditions::has_edit_plan(state),
            StageName::Output,
            Verdict::Warning(EDIT_PLAN_MISSING.to_string()),
        )
        .otherwise(StageName::Render)
        .build()
}

type Condition = Box<dyn Fn(&PipelineState) -> bool + Send + Sync>;

/// Ordered list of (condition, target, verdict); first match wins
pub struct RouterBuilder {
    conditions: Vec<(Condition, StageName, Option<Verdict>)>,
    default: StageName,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            default: StageName::Output,
        }
    }

    /// Add condition with target stage
    pub fn when<F>(mut self, condition: F, target: StageName) -> Self
    where
        F: Fn(&PipelineState) -> bool + Send + Sync + 'static,
    {
        self.conditions.push((Box::new(condition), target, None));
        self
    }

    /// Add condition whose match also records a verdict
    pub fn when_with<F>(mut self, condition: F, target: StageName, verdict: Verdict) -> Self
    where
        F: Fn(&PipelineState) -> bool + Send + Sync + 'static,
    {
        self.conditions.push((Box::new(condition), target, Some(verdict)));
        self
    }

    /// Target when no condition matches
    pub fn otherwise(mut self, target: StageName) -> Self {
        self.default = target;
        self
    }

    pub fn build(self) -> RouterFunction {
        Arc::new(move |state: &PipelineState| {
            for (condition, target, verdict) in &self.conditions {
                if condition(state) {
                    return Route {
                        next: *target,
                        verdict: verdict.clone(),
                    };
                }
            }
            Route::to(self.default)
        })
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicates over pipeline state. Empty collections count as absent.
pub mod conditions {
    use super::PipelineState;

    pub fn has_failed(state: &PipelineState) -> bool {
        state.is_failed()
    }

    pub fn has_frames(state: &PipelineState) -> bool {
        state.frames.as_ref().is_some_and(|frames| !frames.is_empty())
    }

    pub fn has_frame_descriptions(state: &PipelineState) -> bool {
        state
            .frame_descriptions
            .as_ref()
            .is_some_and(|descriptions| !descriptions.is_empty())
    }

    pub fn has_edit_plan(state: &PipelineState) -> bool {
        state.edit_plan.is_some()
    }
}
