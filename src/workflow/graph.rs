// PipelineGraph - Fixed stage topology and transition table
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::router::{self, Route, RouterFunction};
use super::state::PipelineState;
use crate::error::{PipelineError, PipelineResult};

/// Every stage the pipeline knows about, in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Intake,
    FrameExtractor,
    CursorDetector,
    AudioAgent,
    VisionDescription,
    AnalysisAgent,
    ScriptPlanner,
    Render,
    Output,
}

impl StageName {
    pub const ALL: [StageName; 9] = [
        StageName::Intake,
        StageName::FrameExtractor,
        StageName::CursorDetector,
        StageName::AudioAgent,
        StageName::VisionDescription,
        StageName::AnalysisAgent,
        StageName::ScriptPlanner,
        StageName::Render,
        StageName::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Intake => "intake",
            StageName::FrameExtractor => "frame_extractor",
            StageName::CursorDetector => "cursor_detector",
            StageName::AudioAgent => "audio_agent",
            StageName::VisionDescription => "vision_description",
            StageName::AnalysisAgent => "analysis_agent",
            StageName::ScriptPlanner => "script_planner",
            StageName::Render => "render",
            StageName::Output => "output",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::Validation(format!("unknown stage name '{}'", s)))
    }
}

/// Outgoing edge of a stage
#[derive(Clone)]
pub enum Edge {
    /// Always continue to the target
    Always(StageName),
    /// Run every branch concurrently, then join
    FanOut(Vec<StageName>),
    /// Guard decides the target from the current state
    Conditional(RouterFunction),
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Always(target) => write!(f, "Always({})", target),
            Edge::FanOut(targets) => write!(f, "FanOut({:?})", targets),
            Edge::Conditional(_) => write!(f, "Conditional(<guard>)"),
        }
    }
}

/// What the interpreter should do after a stage finishes
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Single(StageName),
    FanOut(Vec<StageName>),
    Finished,
}

/// Statically declared transition table over [`StageName`].
#[derive(Debug)]
pub struct PipelineGraph {
    edges: HashMap<StageName, Edge>,
    /// Possible targets of conditional edges, declared for validation
    conditional_targets: HashMap<StageName, Vec<StageName>>,
    entry: StageName,
    terminal: StageName,
}

impl PipelineGraph {
    /// The production topology.
    ///
    /// intake -> frame_extractor -> {cursor_detector, audio_agent} -> join
    /// -> vision_description -> analysis_agent -> script_planner -> render? -> output
    pub fn standard() -> PipelineResult<Self> {
        PipelineGraphBuilder::new()
            .entry(StageName::Intake)
            .terminal(StageName::Output)
            .edge(StageName::Intake, StageName::FrameExtractor)
            .fan_out(
                StageName::FrameExtractor,
                &[StageName::CursorDetector, StageName::AudioAgent],
            )
            .conditional(
                StageName::CursorDetector,
                router::after_cursor_detection(),
                &[StageName::VisionDescription, StageName::Output],
            )
            .edge(StageName::AudioAgent, StageName::VisionDescription)
            .conditional(
                StageName::VisionDescription,
                router::after_vision_description(),
                &[StageName::AnalysisAgent, StageName::Output],
            )
            .edge(StageName::AnalysisAgent, StageName::ScriptPlanner)
            .conditional(
                StageName::ScriptPlanner,
                router::before_render(),
                &[StageName::Render, StageName::Output],
            )
            .edge(StageName::Render, StageName::Output)
            .build()
    }

    pub fn entry(&self) -> StageName {
        self.entry
    }

    pub fn terminal(&self) -> StageName {
        self.terminal
    }

    pub fn edge(&self, from: StageName) -> Option<&Edge> {
        self.edges.get(&from)
    }

    /// Stages reachable from the entry point (every node the registry must provide)
    pub fn nodes(&self) -> Vec<StageName> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(stage) = stack.pop() {
            if !seen.insert(stage) {
                continue;
            }
            stack.extend(self.successors(stage));
        }
        let mut nodes: Vec<StageName> = seen.into_iter().collect();
        nodes.sort();
        nodes
    }

    /// Evaluate the outgoing edge of `from` against the state.
    ///
    /// Guards are pure: the returned [`Route`] carries any verdict the
    /// caller must record.
    pub fn next(&self, from: StageName, state: &PipelineState) -> (Step, Option<Route>) {
        match self.edges.get(&from) {
            Some(Edge::Always(target)) => (Step::Single(*target), None),
            Some(Edge::FanOut(targets)) => (Step::FanOut(targets.clone()), None),
            Some(Edge::Conditional(guard)) => {
                let route = guard(state);
                (Step::Single(route.next), Some(route))
            }
            None => (Step::Finished, None),
        }
    }

    fn successors(&self, stage: StageName) -> Vec<StageName> {
        match self.edges.get(&stage) {
            Some(Edge::Always(target)) => vec![*target],
            Some(Edge::FanOut(targets)) => targets.clone(),
            Some(Edge::Conditional(_)) => self
                .conditional_targets
                .get(&stage)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.edges.contains_key(&self.terminal) {
            return Err(PipelineError::Validation(format!(
                "terminal stage '{}' must not have outgoing edges",
                self.terminal
            )));
        }

        for (from, edge) in &self.edges {
            if let Edge::FanOut(branches) = edge {
                if branches.len() < 2 {
                    return Err(PipelineError::Validation(format!(
                        "fan-out from '{}' needs at least two branches",
                        from
                    )));
                }
                for branch in branches {
                    if !self.edges.contains_key(branch) {
                        return Err(PipelineError::Validation(format!(
                            "fan-out branch '{}' has no outgoing edge to join on",
                            branch
                        )));
                    }
                }
            }
            if matches!(edge, Edge::Conditional(_)) && !self.conditional_targets.contains_key(from) {
                return Err(PipelineError::Validation(format!(
                    "conditional edge from '{}' declares no targets",
                    from
                )));
            }
        }

        // Every reachable non-terminal stage needs an edge, and the terminal must be reachable
        let nodes = self.nodes();
        for stage in &nodes {
            if *stage != self.terminal && !self.edges.contains_key(stage) {
                return Err(PipelineError::Validation(format!(
                    "stage '{}' is a dead end",
                    stage
                )));
            }
        }
        if !nodes.contains(&self.terminal) {
            return Err(PipelineError::Validation(format!(
                "terminal stage '{}' is unreachable",
                self.terminal
            )));
        }

        if self.has_cycles() {
            return Err(PipelineError::Validation("stage graph contains a cycle".to_string()));
        }

        Ok(())
    }

    /// DFS cycle check across all declared successors
    fn has_cycles(&self) -> bool {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.dfs_cycle_check(self.entry, &mut visited, &mut on_stack)
    }

    fn dfs_cycle_check(
        &self,
        stage: StageName,
        visited: &mut HashSet<StageName>,
        on_stack: &mut HashSet<StageName>,
    ) -> bool {
        visited.insert(stage);
        on_stack.insert(stage);

        for next in self.successors(stage) {
            if on_stack.contains(&next) {
                return true;
            }
            if !visited.contains(&next) && self.dfs_cycle_check(next, visited, on_stack) {
                return true;
            }
        }

        on_stack.remove(&stage);
        false
    }
}

/// Builder for [`PipelineGraph`]; `build` validates the topology.
pub struct PipelineGraphBuilder {
    edges: HashMap<StageName, Edge>,
    conditional_targets: HashMap<StageName, Vec<StageName>>,
    entry: Option<StageName>,
    terminal: Option<StageName>,
}

impl PipelineGraphBuilder {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            conditional_targets: HashMap::new(),
            entry: None,
            terminal: None,
        }
    }

    pub fn entry(mut self, stage: StageName) -> Self {
        self.entry = Some(stage);
        self
    }

    pub fn terminal(mut self, stage: StageName) -> Self {
        self.terminal = Some(stage);
        self
    }

    pub fn edge(mut self, from: StageName, to: StageName) -> Self {
        self.edges.insert(from, Edge::Always(to));
        self
    }

    pub fn fan_out(mut self, from: StageName, branches: &[StageName]) -> Self {
        self.edges.insert(from, Edge::FanOut(branches.to_vec()));
        self
    }

    pub fn conditional(
        mut self,
        from: StageName,
        guard: RouterFunction,
        targets: &[StageName],
    ) -> Self {
        self.edges.insert(from, Edge::Conditional(guard));
        self.conditional_targets.insert(from, targets.to_vec());
        self
    }

    pub fn build(self) -> PipelineResult<PipelineGraph> {
        let entry = self
            .entry
            .ok_or_else(|| PipelineError::Validation("No entry point set".to_string()))?;
        let terminal = self
            .terminal
            .ok_or_else(|| PipelineError::Validation("No terminal stage set".to_string()))?;

        let graph = PipelineGraph {
            edges: self.edges,
            conditional_targets: self.conditional_targets,
            entry,
            terminal,
        };
        graph.validate()?;

        tracing::debug!(
            entry = %graph.entry,
            terminal = %graph.terminal,
            edges = graph.edges.len(),
            "Pipeline graph compiled"
        );
        Ok(graph)
    }
}

impl Default for PipelineGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
