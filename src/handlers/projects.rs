// src/handlers/projects.rs
//! Operator endpoints - projects, stage ledger, checkpoints and retention

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use super::not_found;
use crate::error::PipelineError;
use crate::ledger::{CostSummary, LedgerFilter};
use crate::projects::ProjectStatus;
use crate::AppState;

pub fn project_routes() -> Router {
    Router::new()
        .route("/api/projects", get(list_projects))
        .route(
            "/api/projects/:project_id",
            get(get_project).delete(delete_project),
        )
        .route("/api/projects/:project_id/stages", get(get_project_stages))
        .route("/api/projects/:project_id/cost", get(get_project_cost))
        .route("/api/projects/:project_id/checkpoint", get(get_checkpoint))
        .route("/api/stages", get(query_stages))
        .route("/api/maintenance/cleanup", post(run_cleanup))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProjectListQuery {
    pub user_id: Option<String>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    /// Overrides the configured retention window
    pub days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CleanupResponse {
    pub deleted: usize,
    pub retention_days: i64,
}

/// GET /api/projects - List projects, optionally by user and status
pub async fn list_projects(
    Query(query): Query<ProjectListQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    let projects = state
        .projects
        .list_projects(query.user_id.as_deref(), query.status)
        .await?;
    Ok((StatusCode::OK, Json(projects)).into_response())
}

/// GET /api/projects/:project_id - Project record with its stages and cost
pub async fn get_project(
    Path(project_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    match state.projects.project_status(&project_id).await? {
        Some(report) => Ok((StatusCode::OK, Json(report)).into_response()),
        None => Ok(not_found("Project")),
    }
}

/// GET /api/projects/:project_id/stages - Ledger entries in start order
pub async fn get_project_stages(
    Path(project_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    if state.projects.store().get_project(&project_id).await?.is_none() {
        return Ok(not_found("Project"));
    }
    let stages = state.projects.ledger().stages_for(&project_id).await?;
    Ok((StatusCode::OK, Json(stages)).into_response())
}

/// GET /api/projects/:project_id/cost - Token and dollar totals per stage
pub async fn get_project_cost(
    Path(project_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    if state.projects.store().get_project(&project_id).await?.is_none() {
        return Ok(not_found("Project"));
    }
    let summary: CostSummary = state.projects.ledger().cost_summary(&project_id).await?;
    Ok((StatusCode::OK, Json(summary)).into_response())
}

/// GET /api/projects/:project_id/checkpoint - Last saved pipeline state
pub async fn get_checkpoint(
    Path(project_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    match state.projects.load_checkpoint(&project_id).await? {
        Some(checkpoint) => Ok((StatusCode::OK, Json(checkpoint)).into_response()),
        None => Ok(not_found("Checkpoint")),
    }
}

/// DELETE /api/projects/:project_id - Remove the project, its ledger and checkpoint
pub async fn delete_project(
    Path(project_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    if state.projects.delete_project(&project_id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok(not_found("Project"))
    }
}

/// GET /api/stages - Ledger entries across projects
pub async fn query_stages(
    Query(filter): Query<LedgerFilter>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    let entries = state.projects.ledger().query(&filter).await?;
    Ok((StatusCode::OK, Json(entries)).into_response())
}

/// POST /api/maintenance/cleanup - Delete projects past the retention window
pub async fn run_cleanup(
    Query(query): Query<CleanupQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, PipelineError> {
    let retention_days = query.days.unwrap_or(state.retention_days);
    if retention_days < 0 {
        return Err(PipelineError::Validation(
            "days must not be negative".to_string(),
        ));
    }

    let deleted = state.projects.cleanup_old_projects(retention_days).await?;
    Ok((
        StatusCode::OK,
        Json(CleanupResponse {
            deleted,
            retention_days,
        }),
    )
        .into_response())
}
