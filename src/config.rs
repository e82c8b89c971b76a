// config.rs - Settings loaded once at process start and passed by reference
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Where pipeline checkpoints are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    File,
    Postgres,
}

impl FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(CheckpointBackend::File),
            "postgres" | "pg" => Ok(CheckpointBackend::Postgres),
            other => Err(format!("unknown checkpoint backend '{}'", other)),
        }
    }
}

/// Process-level settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: String,
    pub projects_dir: PathBuf,
    pub checkpoint_backend: CheckpointBackend,
    pub checkpoint_after_each_stage: bool,
    pub project_retention_days: i64,
    pub max_concurrent_projects: usize,
    pub cleanup_interval_secs: u64,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Load `.env` (if present) and read settings from the environment.
    pub fn from_env() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        let pipeline = PipelineConfig {
            frame_extraction: FrameExtractionConfig {
                fps: env.parse_or("DEFAULT_FPS", 2.5)?,
                max_frames: env.parse_or("MAX_FRAMES", 500)?,
                resolution: env.string_or("FRAME_RESOLUTION", "1280x720"),
                format: env.string_or("FRAME_FORMAT", "jpg"),
                quality: env.parse_or("FRAME_QUALITY", 85)?,
            },
            cursor_detection: CursorDetectionConfig {
                model: env.string_or("CURSOR_MODEL", "yolov8"),
                confidence_threshold: env.parse_or("CURSOR_CONFIDENCE_THRESHOLD", 0.7)?,
                click_threshold: env.parse_or("CLICK_DETECTION_THRESHOLD", 10.0)?,
                hover_threshold_seconds: env.parse_or("HOVER_DETECTION_THRESHOLD", 0.5)?,
            },
            vision: VisionConfig {
                model: env.string_or("VISION_MODEL", "gpt-4o"),
                max_tokens: env.parse_or("VISION_MAX_TOKENS", 300)?,
                detail: env.string_or("VISION_DETAIL", "high"),
                sample_rate: env.parse_or("FRAME_SAMPLE_RATE", 5)?,
            },
            audio: AudioConfig {
                whisper_model: env.string_or("WHISPER_MODEL", "whisper-1"),
                language: env.string_or("WHISPER_LANGUAGE", "en"),
                silence_threshold_db: env.parse_or("SILENCE_THRESHOLD_DB", -40)?,
                min_silence_duration: env.parse_or("MIN_SILENCE_DURATION", 0.5)?,
            },
            render: RenderConfig {
                video_codec: env.string_or("VIDEO_CODEC", "libx264"),
                preset: env.string_or("VIDEO_PRESET", "medium"),
                crf: env.parse_or("VIDEO_CRF", 23)?,
                video_bitrate: env.string_or("VIDEO_BITRATE", "8000k"),
                output_fps: env.parse_or("OUTPUT_FPS", 30)?,
                audio_codec: env.string_or("AUDIO_CODEC", "aac"),
                audio_bitrate: env.string_or("AUDIO_BITRATE", "192k"),
            },
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", 5)?,
            bind_addr: env.string_or("BIND_ADDR", "0.0.0.0:3000"),
            projects_dir: PathBuf::from(env.string_or("PROJECTS_DIR", "projects")),
            checkpoint_backend: env.parse_or("CHECKPOINT_BACKEND", CheckpointBackend::File)?,
            checkpoint_after_each_stage: env.parse_or("CHECKPOINT_AFTER_EACH_STAGE", true)?,
            project_retention_days: env.parse_or("PROJECT_RETENTION_DAYS", 30)?,
            max_concurrent_projects: env.parse_or("MAX_CONCURRENT_PROJECTS", 3)?,
            cleanup_interval_secs: env.parse_or("CLEANUP_INTERVAL_SECS", 3600)?,
            pipeline,
        })
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<'a, F> EnvReader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string_or(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> PipelineResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| PipelineError::Config(format!("{}={:?}: {}", key, raw, e))),
            None => Ok(default),
        }
    }
}

/// Immutable per-run configuration handed to every stage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub frame_extraction: FrameExtractionConfig,
    pub cursor_detection: CursorDetectionConfig,
    pub vision: VisionConfig,
    pub audio: AudioConfig,
    pub render: RenderConfig,
}

impl PipelineConfig {
    /// Returns human-readable configuration issues; empty when the config is sane.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let fps = self.frame_extraction.fps;
        if fps <= 0.0 || fps > 10.0 {
            issues.push(format!("DEFAULT_FPS must be between 0 and 10, got {}", fps));
        }
        if self.frame_extraction.max_frames < 50 {
            issues.push(format!(
                "MAX_FRAMES should be at least 50, got {}",
                self.frame_extraction.max_frames
            ));
        }
        if self.render.crf > 51 {
            issues.push(format!("VIDEO_CRF must be between 0 and 51, got {}", self.render.crf));
        }
        if self.vision.sample_rate == 0 {
            issues.push("FRAME_SAMPLE_RATE must be at least 1".to_string());
        }
        let confidence = self.cursor_detection.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            issues.push(format!(
                "CURSOR_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                confidence
            ));
        }

        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameExtractionConfig {
    pub fps: f64,
    pub max_frames: u32,
    pub resolution: String,
    pub format: String,
    pub quality: u8,
}

impl Default for FrameExtractionConfig {
    fn default() -> Self {
        Self {
            fps: 2.5,
            max_frames: 500,
            resolution: "1280x720".to_string(),
            format: "jpg".to_string(),
            quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorDetectionConfig {
    pub model: String,
    pub confidence_threshold: f32,
    /// Pixel movement below which a pause is treated as a click
    pub click_threshold: f32,
    pub hover_threshold_seconds: f64,
}

impl Default for CursorDetectionConfig {
    fn default() -> Self {
        Self {
            model: "yolov8".to_string(),
            confidence_threshold: 0.7,
            click_threshold: 10.0,
            hover_threshold_seconds: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    pub model: String,
    pub max_tokens: u32,
    pub detail: String,
    /// Describe every Nth frame
    pub sample_rate: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tokens: 300,
            detail: "high".to_string(),
            sample_rate: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub whisper_model: String,
    pub language: String,
    pub silence_threshold_db: i32,
    pub min_silence_duration: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            whisper_model: "whisper-1".to_string(),
            language: "en".to_string(),
            silence_threshold_db: -40,
            min_silence_duration: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub video_bitrate: String,
    pub output_fps: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            video_bitrate: "8000k".to_string(),
            output_fps: 30,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    Slow,
    #[default]
    Medium,
    Fast,
}

/// Editing preferences supplied by the user for a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub narration_style: String,
    pub keep_original_audio: bool,
    pub music: bool,
    pub pacing: Pacing,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            narration_style: "professional".to_string(),
            keep_original_audio: false,
            music: false,
            pacing: Pacing::Medium,
        }
    }
}
