// Checkpointing - Persist and resume pipeline runs (one slot per project)
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info};

use super::state::PipelineState;
use crate::error::{PipelineError, PipelineResult};

pub const CHECKPOINT_FILE: &str = "pipeline_state.json";

/// Saves and loads pipeline state. Saving overwrites any previous checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, project_id: &str, state: &PipelineState) -> PipelineResult<()>;

    async fn load(&self, project_id: &str) -> PipelineResult<Option<PipelineState>>;

    /// Removing a checkpoint that does not exist is not an error
    async fn delete(&self, project_id: &str) -> PipelineResult<()>;
}

/// Checkpoints as JSON files under `<root>/<project_id>/state/`
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<project_id>`; the id must name a single directory inside the root
    pub fn project_dir(&self, project_id: &str) -> PipelineResult<PathBuf> {
        validate_project_id(project_id)?;
        Ok(self.root.join(project_id))
    }

    pub fn checkpoint_path(&self, project_id: &str) -> PipelineResult<PathBuf> {
        Ok(self.project_dir(project_id)?.join("state").join(CHECKPOINT_FILE))
    }
}

/// Rejects ids that are empty, absolute, contain a separator or are `.`/`..`
pub fn validate_project_id(project_id: &str) -> PipelineResult<()> {
    let mut components = Path::new(project_id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == project_id
    );
    if single_normal && !project_id.contains(['/', '\\']) {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!(
            "invalid project id {:?}",
            project_id
        )))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, project_id: &str, state: &PipelineState) -> PipelineResult<()> {
        let path = self.checkpoint_path(project_id)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        // rename is atomic on the same filesystem
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            error!(project_id, "Failed to save checkpoint: {}", e);
            e
        })?;

        debug!(project_id, path = %path.display(), "💾 Checkpoint saved");
        Ok(())
    }

    async fn load(&self, project_id: &str) -> PipelineResult<Option<PipelineState>> {
        let path = self.checkpoint_path(project_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete(&self, project_id: &str) -> PipelineResult<()> {
        remove_dir_if_exists(&self.project_dir(project_id)?).await
    }
}

async fn remove_dir_if_exists(dir: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Checkpoints as JSONB rows in `pipeline_checkpoints`
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// When the current checkpoint for a project was written
    pub async fn saved_at(&self, project_id: &str) -> PipelineResult<Option<DateTime<Utc>>> {
        let saved_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT updated_at FROM pipeline_checkpoints WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(saved_at)
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, project_id: &str, state: &PipelineState) -> PipelineResult<()> {
        let state_json = serde_json::to_value(state)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoints (project_id, state, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(project_id)
        .bind(state_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(project_id, "Failed to save checkpoint: {}", e);
            e
        })?;

        debug!(project_id, "💾 Checkpoint saved");
        Ok(())
    }

    async fn load(&self, project_id: &str) -> PipelineResult<Option<PipelineState>> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT state FROM pipeline_checkpoints WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, project_id: &str) -> PipelineResult<()> {
        let result = sqlx::query("DELETE FROM pipeline_checkpoints WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(project_id, "🧹 Checkpoint removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, UserPreferences};
    use crate::types::{EditOperation, EditPlan, Frame, Transcript};
    use crate::workflow::graph::StageName;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("checkpoint-test-{}", Uuid::new_v4()))
    }

    fn populated_state() -> PipelineState {
        let mut state = PipelineState::create(
            "p-42",
            "/videos/demo.mp4",
            PipelineConfig::default(),
            UserPreferences::default(),
        )
        .unwrap();
        state.begin_run();
        state.frames = Some(vec![Frame {
            index: 3,
            timestamp: 1.5,
            path: "frames/0003.jpg".to_string(),
        }]);
        state.transcript = Some(Transcript {
            text: "Open the settings page".to_string(),
            language: Some("en".to_string()),
            segments: Vec::new(),
        });
        state.edit_plan = Some(EditPlan {
            operations: vec![EditOperation::Cut { start: 4.0, end: 6.5 }],
        });
        state.mark_stage_complete(StageName::Intake);
        state.mark_stage_complete(StageName::FrameExtractor);
        state.accumulate_cost(1234, Decimal::new(4321, 4)).unwrap();
        state.record_warning("no speech in first 10s");
        state
    }

    #[tokio::test]
    async fn test_file_checkpoint_round_trip() {
        let root = temp_root();
        let store = FileCheckpointStore::new(&root);
        let state = populated_state();

        store.save("p-42", &state).await.unwrap();
        assert!(store.checkpoint_path("p-42").unwrap().exists());

        let loaded = store.load("p-42").await.unwrap().unwrap();
        assert_eq!(loaded, state);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_checkpoint_overwrites_single_slot() {
        let root = temp_root();
        let store = FileCheckpointStore::new(&root);
        let mut state = populated_state();
        store.save("p-42", &state).await.unwrap();

        state.mark_stage_complete(StageName::CursorDetector);
        store.save("p-42", &state).await.unwrap();

        let loaded = store.load("p-42").await.unwrap().unwrap();
        assert_eq!(loaded.completed_stages().len(), 3);
        assert!(!store.checkpoint_path("p-42").unwrap().with_extension("json.tmp").exists());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_checkpoint_missing_and_delete() {
        let root = temp_root();
        let store = FileCheckpointStore::new(&root);
        assert!(store.load("nobody").await.unwrap().is_none());

        store.save("p-42", &populated_state()).await.unwrap();
        store.delete("p-42").await.unwrap();
        assert!(store.load("p-42").await.unwrap().is_none());
        store.delete("p-42").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_checkpoint_rejects_ids_outside_root() {
        let base = temp_root();
        let root = base.join("projects");
        let outside = base.join("victim");
        tokio::fs::create_dir_all(&outside).await.unwrap();
        tokio::fs::write(outside.join("precious.txt"), b"keep").await.unwrap();

        let store = FileCheckpointStore::new(&root);
        let absolute = outside.to_string_lossy().into_owned();
        for id in [absolute.as_str(), "..", "../victim", ".", "", "a/b"] {
            assert!(
                matches!(store.delete(id).await, Err(PipelineError::Validation(_))),
                "{:?} was accepted",
                id
            );
            assert!(store.save(id, &populated_state()).await.is_err());
            assert!(store.load(id).await.is_err());
        }
        assert!(outside.join("precious.txt").exists());

        validate_project_id("3f2a7c1e-9b4d-4e8a-a1c2-5d6e7f8a9b0c").unwrap();
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }
}
