// types.rs - Artifacts produced and consumed by pipeline stages
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// Video metadata probed at intake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_seconds: f64,
    pub file_size_mb: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: Option<String>,
}

impl VideoMetadata {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

// Frame extraction output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: u32,
    pub timestamp: f64,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorEventKind {
    Move,
    Click,
    Hover,
}

// Cursor detection output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorEvent {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub kind: CursorEventKind,
    pub confidence: f32,
}

// Vision description output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDescription {
    pub frame_index: u32,
    pub timestamp: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

// Audio processing output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceSegment {
    pub start: f64,
    pub end: f64,
}

impl SilenceSegment {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

// Analysis output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub start: f64,
    pub end: f64,
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSegment {
    pub start: f64,
    pub text: String,
}

// Script planning output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationScript {
    pub style: String,
    pub segments: Vec<NarrationSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EditOperation {
    Cut { start: f64, end: f64 },
    SpeedChange { start: f64, end: f64, factor: f64 },
    Zoom { start: f64, end: f64, x: f64, y: f64, scale: f64 },
    Highlight { start: f64, end: f64, x: f64, y: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EditPlan {
    pub operations: Vec<EditOperation>,
}

impl EditPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Tokens and dollars consumed by one stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub tokens: i64,
    pub cost_usd: Decimal,
}

impl Usage {
    pub fn new(tokens: i64, cost_usd: Decimal) -> Self {
        Self { tokens, cost_usd }
    }

    pub fn is_valid(&self) -> bool {
        self.tokens >= 0 && !self.cost_usd.is_sign_negative()
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            tokens: self.tokens + rhs.tokens,
            cost_usd: self.cost_usd + rhs.cost_usd,
        }
    }
}

/// A collaborator result together with what it cost to produce
#[derive(Debug, Clone, PartialEq)]
pub struct Metered<T> {
    pub output: T,
    pub usage: Usage,
}

impl<T> Metered<T> {
    pub fn free(output: T) -> Self {
        Self {
            output,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(output: T, usage: Usage) -> Self {
        Self { output, usage }
    }
}
