// Postgres-backed project table and stage ledger
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{
    duration_seconds, CostSummary, LedgerEntry, LedgerEntryId, LedgerFilter, LedgerStatus,
    NewLedgerEntry, StageLedger,
};
use crate::projects::{NewProject, ProjectRecord, ProjectStatus, ProjectStore, INITIAL_STAGE};
use crate::types::Usage;
use crate::workflow::graph::StageName;

/// Column list for `pipeline_stages` queries.
const STAGE_COLUMNS: &str = "\
    id, project_id, stage_name, status, start_time, end_time, \
    duration_seconds, tokens_used, cost_usd, error_message";

/// Column list for `projects` queries.
const PROJECT_COLUMNS: &str = "\
    project_id, user_id, video_name, video_path, status, current_stage, \
    created_at, upload_time, processing_start, processing_end, \
    duration_seconds, file_size_mb, resolution, error_message";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn start_time_of(&self, id: LedgerEntryId) -> PipelineResult<DateTime<Utc>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT start_time FROM pipeline_stages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::Storage(format!("ledger entry {} not found", id)))
    }
}

#[async_trait]
impl StageLedger for PgStore {
    async fn append(&self, entry: NewLedgerEntry) -> PipelineResult<LedgerEntryId> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO pipeline_stages (project_id, stage_name, status, start_time) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id",
        )
        .bind(&entry.project_id)
        .bind(entry.stage_name.as_str())
        .bind(LedgerStatus::Started.as_str())
        .bind(entry.start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn complete(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        usage: Usage,
    ) -> PipelineResult<()> {
        let start_time = self.start_time_of(id).await?;
        let result = sqlx::query(
            "UPDATE pipeline_stages \
             SET status = $2, end_time = $3, duration_seconds = $4, tokens_used = $5, cost_usd = $6 \
             WHERE id = $1 AND status = $7",
        )
        .bind(id)
        .bind(LedgerStatus::Completed.as_str())
        .bind(end_time)
        .bind(duration_seconds(start_time, end_time))
        .bind(usage.tokens)
        .bind(usage.cost_usd)
        .bind(LedgerStatus::Started.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Storage(format!(
                "ledger entry {} is not open",
                id
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        error_message: &str,
    ) -> PipelineResult<()> {
        let start_time = self.start_time_of(id).await?;
        let result = sqlx::query(
            "UPDATE pipeline_stages \
             SET status = $2, end_time = $3, duration_seconds = $4, error_message = $5 \
             WHERE id = $1 AND status = $6",
        )
        .bind(id)
        .bind(LedgerStatus::Failed.as_str())
        .bind(end_time)
        .bind(duration_seconds(start_time, end_time))
        .bind(error_message)
        .bind(LedgerStatus::Started.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Storage(format!(
                "ledger entry {} is not open",
                id
            )));
        }
        Ok(())
    }

    async fn query(&self, filter: &LedgerFilter) -> PipelineResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {STAGE_COLUMNS} FROM pipeline_stages \
             WHERE ($1::TEXT IS NULL OR project_id = $1) \
               AND ($2::TEXT IS NULL OR stage_name = $2) \
               AND ($3::TEXT IS NULL OR status = $3) \
             ORDER BY start_time ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, StageRow>(&query)
            .bind(filter.project_id.as_deref())
            .bind(filter.stage_name.map(|stage| stage.as_str()))
            .bind(filter.status.map(|status| status.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn cost_summary(&self, project_id: &str) -> PipelineResult<CostSummary> {
        let rows = sqlx::query_as::<_, (String, i64, Decimal, i64)>(
            "SELECT stage_name, COALESCE(SUM(tokens_used), 0)::BIGINT, \
                    COALESCE(SUM(cost_usd), 0), COUNT(*) \
             FROM pipeline_stages \
             WHERE project_id = $1 \
             GROUP BY stage_name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = CostSummary::from_entries(&[]);
        for (stage_name, tokens, cost, count) in rows {
            let stage: StageName = stage_name.parse()?;
            summary.total_tokens += tokens;
            summary.total_cost_usd += cost;
            summary.entries += count as usize;
            *summary.breakdown.entry(stage).or_insert(Decimal::ZERO) += cost;
        }
        Ok(summary)
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn create_project(&self, project: NewProject) -> PipelineResult<ProjectRecord> {
        let query = format!(
            "INSERT INTO projects \
             (project_id, user_id, video_name, video_path, status, current_stage, \
              created_at, upload_time, duration_seconds, file_size_mb, resolution) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $9, $10) \
             RETURNING {PROJECT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(&project.project_id)
            .bind(&project.user_id)
            .bind(&project.video_name)
            .bind(&project.video_path)
            .bind(ProjectStatus::Created.as_str())
            .bind(INITIAL_STAGE)
            .bind(Utc::now())
            .bind(project.duration_seconds)
            .bind(project.file_size_mb)
            .bind(&project.resolution)
            .fetch_one(&self.pool)
            .await?;

        ProjectRecord::try_from(row)
    }

    async fn get_project(&self, project_id: &str) -> PipelineResult<Option<ProjectRecord>> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE project_id = $1");
        let row = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ProjectRecord::try_from).transpose()
    }

    async fn list_projects(
        &self,
        user_id: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> PipelineResult<Vec<ProjectRecord>> {
        let query = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE ($1::TEXT IS NULL OR user_id = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(user_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProjectRecord::try_from).collect()
    }

    async fn update_stage(
        &self,
        project_id: &str,
        status: ProjectStatus,
        current_stage: &str,
    ) -> PipelineResult<()> {
        sqlx::query("UPDATE projects SET status = $2, current_stage = $3 WHERE project_id = $1")
            .bind(project_id)
            .bind(status.as_str())
            .bind(current_stage)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_processing_started(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE projects SET status = $2, processing_start = $3 WHERE project_id = $1",
        )
        .bind(project_id)
        .bind(ProjectStatus::Processing.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_processing_finished(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE projects \
             SET status = $2, processing_end = $3, error_message = COALESCE($4, error_message) \
             WHERE project_id = $1",
        )
        .bind(project_id)
        .bind(status.as_str())
        .bind(at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_project(&self, project_id: &str) -> PipelineResult<bool> {
        // pipeline_stages and pipeline_checkpoints cascade
        let result = sqlx::query("DELETE FROM projects WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(project_id, "Delete requested for unknown project");
            return Ok(false);
        }
        info!(project_id, "Deleted project row and its stage history");
        Ok(true)
    }

    async fn projects_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProjectRecord>> {
        let query = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE created_at < $1 ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, ProjectRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProjectRecord::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    project_id: String,
    stage_name: String,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    tokens_used: i64,
    cost_usd: Decimal,
    error_message: Option<String>,
}

impl TryFrom<StageRow> for LedgerEntry {
    type Error = PipelineError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            project_id: row.project_id,
            stage_name: row.stage_name.parse()?,
            status: row.status.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_seconds: row.duration_seconds,
            tokens_used: row.tokens_used,
            cost_usd: row.cost_usd,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: String,
    user_id: String,
    video_name: String,
    video_path: String,
    status: String,
    current_stage: String,
    created_at: DateTime<Utc>,
    upload_time: Option<DateTime<Utc>>,
    processing_start: Option<DateTime<Utc>>,
    processing_end: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    file_size_mb: Option<f64>,
    resolution: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<ProjectRow> for ProjectRecord {
    type Error = PipelineError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(ProjectRecord {
            project_id: row.project_id,
            user_id: row.user_id,
            video_name: row.video_name,
            video_path: row.video_path,
            status: row.status.parse()?,
            current_stage: row.current_stage,
            created_at: row.created_at,
            upload_time: row.upload_time,
            processing_start: row.processing_start,
            processing_end: row.processing_end,
            duration_seconds: row.duration_seconds,
            file_size_mb: row.file_size_mb,
            resolution: row.resolution,
            error_message: row.error_message,
        })
    }
}
