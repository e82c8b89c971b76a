// projects.rs - Project records and the manager operators interact with
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{CostSummary, LedgerEntry, StageLedger};
use crate::workflow::checkpoint::CheckpointStore;
use crate::workflow::stages::VideoProber;
use crate::workflow::state::PipelineState;

pub const INITIAL_STAGE: &str = "initialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Processing => "processing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ProjectStatus::Created),
            "processing" => Ok(ProjectStatus::Processing),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            other => Err(PipelineError::Validation(format!("unknown project status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub user_id: String,
    pub video_name: String,
    pub video_path: String,
    pub status: ProjectStatus,
    pub current_stage: String,
    pub created_at: DateTime<Utc>,
    pub upload_time: Option<DateTime<Utc>>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub file_size_mb: Option<f64>,
    pub resolution: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub project_id: String,
    pub user_id: String,
    pub video_name: String,
    pub video_path: String,
    pub duration_seconds: Option<f64>,
    pub file_size_mb: Option<f64>,
    pub resolution: Option<String>,
}

impl NewProject {
    pub fn into_record(self, now: DateTime<Utc>) -> ProjectRecord {
        ProjectRecord {
            project_id: self.project_id,
            user_id: self.user_id,
            video_name: self.video_name,
            video_path: self.video_path,
            status: ProjectStatus::Created,
            current_stage: INITIAL_STAGE.to_string(),
            created_at: now,
            upload_time: Some(now),
            processing_start: None,
            processing_end: None,
            duration_seconds: self.duration_seconds,
            file_size_mb: self.file_size_mb,
            resolution: self.resolution,
            error_message: None,
        }
    }
}

/// Durable project table. Deleting a project cascades to its ledger entries.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_project(&self, project: NewProject) -> PipelineResult<ProjectRecord>;

    async fn get_project(&self, project_id: &str) -> PipelineResult<Option<ProjectRecord>>;

    async fn list_projects(
        &self,
        user_id: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> PipelineResult<Vec<ProjectRecord>>;

    async fn update_stage(
        &self,
        project_id: &str,
        status: ProjectStatus,
        current_stage: &str,
    ) -> PipelineResult<()>;

    async fn mark_processing_started(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<()>;

    async fn mark_processing_finished(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> PipelineResult<()>;

    /// Returns false when the project did not exist
    async fn delete_project(&self, project_id: &str) -> PipelineResult<bool>;

    async fn projects_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProjectRecord>>;
}

/// Project plus everything the ledger knows about it
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatusReport {
    pub project: ProjectRecord,
    pub stages: Vec<LedgerEntry>,
    pub cost: CostSummary,
}

/// Manages video editing projects across the project store, ledger and checkpoints
#[derive(Clone)]
pub struct ProjectManager {
    projects: Arc<dyn ProjectStore>,
    ledger: Arc<dyn StageLedger>,
    checkpoints: Arc<dyn CheckpointStore>,
    prober: Option<Arc<dyn VideoProber>>,
}

impl ProjectManager {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        ledger: Arc<dyn StageLedger>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            projects,
            ledger,
            checkpoints,
            prober: None,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn VideoProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn store(&self) -> Arc<dyn ProjectStore> {
        self.projects.clone()
    }

    pub fn ledger(&self) -> Arc<dyn StageLedger> {
        self.ledger.clone()
    }

    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoints.clone()
    }

    /// Register a new project for a video file
    pub async fn create_project(
        &self,
        video_path: &str,
        user_id: &str,
    ) -> PipelineResult<ProjectRecord> {
        if video_path.trim().is_empty() {
            return Err(PipelineError::Validation("video_path must not be empty".to_string()));
        }
        let path = Path::new(video_path);
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            PipelineError::Validation(format!("cannot read video {}: {}", video_path, e))
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::Validation(format!("{} is not a file", video_path)));
        }

        let probed = match &self.prober {
            Some(prober) => match prober.probe(path).await {
                Ok(probed) => Some(probed.output),
                Err(e) => {
                    return Err(PipelineError::Validation(format!(
                        "failed to read video metadata: {}",
                        e
                    )))
                }
            },
            None => None,
        };

        let video_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| video_path.to_string());

        let new_project = NewProject {
            project_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            video_name,
            video_path: video_path.to_string(),
            duration_seconds: probed.as_ref().map(|m| m.duration_seconds),
            file_size_mb: probed
                .as_ref()
                .map(|m| m.file_size_mb)
                .or_else(|| Some(round_mb(metadata.len()))),
            resolution: probed.as_ref().map(|m| m.resolution()),
        };

        let record = self.projects.create_project(new_project).await?;
        info!(project_id = %record.project_id, video = %record.video_name, "📁 Created project");
        Ok(record)
    }

    pub async fn project_status(
        &self,
        project_id: &str,
    ) -> PipelineResult<Option<ProjectStatusReport>> {
        let Some(project) = self.projects.get_project(project_id).await? else {
            return Ok(None);
        };
        let stages = self.ledger.stages_for(project_id).await?;
        let cost = CostSummary::from_entries(&stages);

        Ok(Some(ProjectStatusReport {
            project,
            stages,
            cost,
        }))
    }

    pub async fn list_projects(
        &self,
        user_id: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> PipelineResult<Vec<ProjectRecord>> {
        self.projects.list_projects(user_id, status).await
    }

    /// Delete the project row (cascading its ledger) and its checkpoint
    pub async fn delete_project(&self, project_id: &str) -> PipelineResult<bool> {
        let existed = self.projects.delete_project(project_id).await?;
        if existed {
            self.checkpoints.delete(project_id).await?;
            info!(project_id, "🗑️ Deleted project");
        }
        Ok(existed)
    }

    /// Delete projects created more than `days` days ago; returns how many went
    pub async fn cleanup_old_projects(&self, days: i64) -> PipelineResult<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        let stale = self.projects.projects_created_before(cutoff).await?;

        let mut deleted = 0;
        for project in stale {
            match self.delete_project(&project.project_id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(project_id = %project.project_id, "Failed to delete stale project: {}", e);
                }
            }
        }

        info!("🧹 Cleaned up {} old projects", deleted);
        Ok(deleted)
    }

    pub async fn save_checkpoint(&self, state: &PipelineState) -> PipelineResult<()> {
        self.checkpoints.save(state.project_id(), state).await
    }

    pub async fn load_checkpoint(&self, project_id: &str) -> PipelineResult<Option<PipelineState>> {
        match self.checkpoints.load(project_id).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(project_id, "Failed to load checkpoint: {}", e);
                Err(e)
            }
        }
    }
}

fn round_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}
