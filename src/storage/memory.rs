// In-process store used when no database is configured, and by tests
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{LedgerEntry, LedgerEntryId, LedgerFilter, NewLedgerEntry, StageLedger};
use crate::projects::{NewProject, ProjectRecord, ProjectStatus, ProjectStore};
use crate::types::Usage;
use crate::workflow::checkpoint::CheckpointStore;
use crate::workflow::state::PipelineState;

#[derive(Default)]
struct Tables {
    projects: HashMap<String, ProjectRecord>,
    stages: Vec<LedgerEntry>,
    next_stage_id: LedgerEntryId,
    /// Serialized so loads go through the same path as durable backends
    checkpoints: HashMap<String, String>,
}

/// Ledger, project table and checkpoint slots behind one lock.
///
/// Deleting a project drops its ledger entries and checkpoint, matching the
/// cascading foreign keys of the Postgres schema. Ledger appends do not
/// require the project row to exist.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, replacing any with the same id
    pub async fn insert_record(&self, record: ProjectRecord) {
        let mut tables = self.tables.write().await;
        tables.projects.insert(record.project_id.clone(), record);
    }

    async fn update_project<F>(&self, project_id: &str, f: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut ProjectRecord) + Send,
    {
        let mut tables = self.tables.write().await;
        if let Some(project) = tables.projects.get_mut(project_id) {
            f(project);
        }
        Ok(())
    }

    async fn finish_entry<F>(&self, id: LedgerEntryId, f: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut LedgerEntry) -> PipelineResult<()> + Send,
    {
        let mut tables = self.tables.write().await;
        let entry = tables
            .stages
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| PipelineError::Storage(format!("ledger entry {} not found", id)))?;
        f(entry)
    }
}

#[async_trait]
impl StageLedger for MemoryStore {
    async fn append(&self, entry: NewLedgerEntry) -> PipelineResult<LedgerEntryId> {
        let mut tables = self.tables.write().await;
        tables.next_stage_id += 1;
        let id = tables.next_stage_id;
        tables.stages.push(LedgerEntry::started(id, &entry));
        Ok(id)
    }

    async fn complete(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        usage: Usage,
    ) -> PipelineResult<()> {
        self.finish_entry(id, |entry| entry.complete(end_time, usage))
            .await
    }

    async fn fail(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        error_message: &str,
    ) -> PipelineResult<()> {
        let message = error_message.to_string();
        self.finish_entry(id, move |entry| entry.fail(end_time, &message))
            .await
    }

    async fn query(&self, filter: &LedgerFilter) -> PipelineResult<Vec<LedgerEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<LedgerEntry> = tables
            .stages
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(entries)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(&self, project: NewProject) -> PipelineResult<ProjectRecord> {
        let mut tables = self.tables.write().await;
        if tables.projects.contains_key(&project.project_id) {
            return Err(PipelineError::Storage(format!(
                "project {} already exists",
                project.project_id
            )));
        }
        let record = project.into_record(Utc::now());
        tables
            .projects
            .insert(record.project_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_project(&self, project_id: &str) -> PipelineResult<Option<ProjectRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.projects.get(project_id).cloned())
    }

    async fn list_projects(
        &self,
        user_id: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> PipelineResult<Vec<ProjectRecord>> {
        let tables = self.tables.read().await;
        let mut projects: Vec<ProjectRecord> = tables
            .projects
            .values()
            .filter(|p| user_id.map_or(true, |user| p.user_id == user))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn update_stage(
        &self,
        project_id: &str,
        status: ProjectStatus,
        current_stage: &str,
    ) -> PipelineResult<()> {
        let current_stage = current_stage.to_string();
        self.update_project(project_id, move |project| {
            project.status = status;
            project.current_stage = current_stage;
        })
        .await
    }

    async fn mark_processing_started(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        self.update_project(project_id, move |project| {
            project.status = ProjectStatus::Processing;
            project.processing_start = Some(at);
        })
        .await
    }

    async fn mark_processing_finished(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
        status: ProjectStatus,
        error_message: Option<&str>,
    ) -> PipelineResult<()> {
        let error_message = error_message.map(str::to_string);
        self.update_project(project_id, move |project| {
            project.status = status;
            project.processing_end = Some(at);
            if error_message.is_some() {
                project.error_message = error_message;
            }
        })
        .await
    }

    async fn delete_project(&self, project_id: &str) -> PipelineResult<bool> {
        let mut tables = self.tables.write().await;
        let existed = tables.projects.remove(project_id).is_some();
        if existed {
            tables.stages.retain(|entry| entry.project_id != project_id);
            tables.checkpoints.remove(project_id);
        }
        Ok(existed)
    }

    async fn projects_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PipelineResult<Vec<ProjectRecord>> {
        let tables = self.tables.read().await;
        let mut projects: Vec<ProjectRecord> = tables
            .projects
            .values()
            .filter(|p| p.created_at < cutoff)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, project_id: &str, state: &PipelineState) -> PipelineResult<()> {
        let json = serde_json::to_string(state)?;
        let mut tables = self.tables.write().await;
        tables.checkpoints.insert(project_id.to_string(), json);
        Ok(())
    }

    async fn load(&self, project_id: &str) -> PipelineResult<Option<PipelineState>> {
        let tables = self.tables.read().await;
        match tables.checkpoints.get(project_id) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, project_id: &str) -> PipelineResult<()> {
        let mut tables = self.tables.write().await;
        tables.checkpoints.remove(project_id);
        Ok(())
    }
}
