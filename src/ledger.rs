// Stage ledger - append-only record of every stage invocation and its cost
use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::Usage;
use crate::workflow::graph::StageName;

pub type LedgerEntryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Started,
    Completed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Started => "started",
            LedgerStatus::Completed => "completed",
            LedgerStatus::Failed => "failed",
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(LedgerStatus::Started),
            "completed" => Ok(LedgerStatus::Completed),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(PipelineError::Validation(format!("unknown ledger status '{}'", other))),
        }
    }
}

/// One row per stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub project_id: String,
    pub stage_name: StageName,
    pub status: LedgerStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub tokens_used: i64,
    pub cost_usd: Decimal,
    pub error_message: Option<String>,
}

impl LedgerEntry {
    /// Insert form of an entry: status `started`, nothing measured yet
    pub fn started(id: LedgerEntryId, new: &NewLedgerEntry) -> Self {
        Self {
            id,
            project_id: new.project_id.clone(),
            stage_name: new.stage_name,
            status: LedgerStatus::Started,
            start_time: new.start_time,
            end_time: None,
            duration_seconds: None,
            tokens_used: 0,
            cost_usd: Decimal::ZERO,
            error_message: None,
        }
    }

    /// Fill completion fields; rejected unless the entry is still open
    pub fn complete(&mut self, end_time: DateTime<Utc>, usage: Usage) -> PipelineResult<()> {
        self.ensure_open()?;
        self.status = LedgerStatus::Completed;
        self.end_time = Some(end_time);
        self.duration_seconds = Some(duration_seconds(self.start_time, end_time));
        self.tokens_used = usage.tokens;
        self.cost_usd = usage.cost_usd;
        Ok(())
    }

    pub fn fail(&mut self, end_time: DateTime<Utc>, message: &str) -> PipelineResult<()> {
        self.ensure_open()?;
        self.status = LedgerStatus::Failed;
        self.end_time = Some(end_time);
        self.duration_seconds = Some(duration_seconds(self.start_time, end_time));
        self.error_message = Some(message.to_string());
        Ok(())
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.status != LedgerStatus::Started {
            return Err(PipelineError::Storage(format!(
                "ledger entry {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

/// `end - start` in seconds at millisecond precision
pub fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub project_id: String,
    pub stage_name: StageName,
    pub start_time: DateTime<Utc>,
}

/// Filter for operator queries; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LedgerFilter {
    pub project_id: Option<String>,
    pub stage_name: Option<StageName>,
    pub status: Option<LedgerStatus>,
}

impl LedgerFilter {
    pub fn for_project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.project_id.as_deref().map_or(true, |id| id == entry.project_id)
            && self.stage_name.map_or(true, |stage| stage == entry.stage_name)
            && self.status.map_or(true, |status| status == entry.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_tokens: i64,
    pub total_cost_usd: Decimal,
    /// Cost per distinct stage, summed across resumed runs
    pub breakdown: BTreeMap<StageName, Decimal>,
    pub entries: usize,
}

impl CostSummary {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut breakdown = BTreeMap::new();
        let mut total_tokens = 0;
        let mut total_cost_usd = Decimal::ZERO;

        for entry in entries {
            total_tokens += entry.tokens_used;
            total_cost_usd += entry.cost_usd;
            *breakdown.entry(entry.stage_name).or_insert(Decimal::ZERO) += entry.cost_usd;
        }

        Self {
            total_tokens,
            total_cost_usd,
            breakdown,
            entries: entries.len(),
        }
    }
}

/// Durable execution history, shared by all runs in the process.
#[async_trait]
pub trait StageLedger: Send + Sync {
    /// Insert a `started` row and return its id
    async fn append(&self, entry: NewLedgerEntry) -> PipelineResult<LedgerEntryId>;

    async fn complete(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        usage: Usage,
    ) -> PipelineResult<()>;

    async fn fail(
        &self,
        id: LedgerEntryId,
        end_time: DateTime<Utc>,
        error_message: &str,
    ) -> PipelineResult<()>;

    /// Entries matching the filter, ordered by (start_time, id)
    async fn query(&self, filter: &LedgerFilter) -> PipelineResult<Vec<LedgerEntry>>;

    async fn stages_for(&self, project_id: &str) -> PipelineResult<Vec<LedgerEntry>> {
        self.query(&LedgerFilter::for_project(project_id)).await
    }

    async fn cost_summary(&self, project_id: &str) -> PipelineResult<CostSummary> {
        let entries = self.stages_for(project_id).await?;
        Ok(CostSummary::from_entries(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn entry(id: LedgerEntryId, stage: StageName, cost: Decimal) -> LedgerEntry {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut entry = LedgerEntry::started(
            id,
            &NewLedgerEntry {
                project_id: "p1".to_string(),
                stage_name: stage,
                start_time: start,
            },
        );
        entry
            .complete(start + Duration::seconds(1), Usage::new(100, cost))
            .unwrap();
        entry
    }

    #[test]
    fn test_duration_is_end_minus_start() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let t1 = t0 + Duration::milliseconds(3750);
        let mut entry = LedgerEntry::started(
            1,
            &NewLedgerEntry {
                project_id: "p1".to_string(),
                stage_name: StageName::Render,
                start_time: t0,
            },
        );
        assert!(entry.duration_seconds.is_none());

        entry.complete(t1, Usage::default()).unwrap();
        assert_eq!(entry.duration_seconds, Some(3.75));
        assert_eq!(entry.end_time, Some(t1));
    }

    #[test]
    fn test_finalized_entry_cannot_change() {
        let mut entry = entry(1, StageName::Intake, Decimal::ZERO);
        let err = entry.fail(Utc::now(), "late failure").unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(entry.status, LedgerStatus::Completed);
        assert!(entry.error_message.is_none());
    }

    #[test]
    fn test_cost_summary_groups_by_stage() {
        let a = StageName::VisionDescription;
        let b = StageName::ScriptPlanner;
        let entries = vec![
            entry(1, a, Decimal::new(100, 2)),
            entry(2, a, Decimal::new(200, 2)),
            entry(3, b, Decimal::new(50, 2)),
        ];

        let summary = CostSummary::from_entries(&entries);
        assert_eq!(summary.total_cost_usd, Decimal::new(350, 2));
        assert_eq!(summary.total_tokens, 300);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.breakdown.len(), 2);
        assert_eq!(summary.breakdown[&a], Decimal::new(300, 2));
        assert_eq!(summary.breakdown[&b], Decimal::new(50, 2));
    }

    #[test]
    fn test_filter_matches_on_every_given_field() {
        let e = entry(1, StageName::Render, Decimal::ZERO);
        assert!(LedgerFilter::default().matches(&e));
        assert!(LedgerFilter::for_project("p1").matches(&e));
        assert!(!LedgerFilter::for_project("p2").matches(&e));

        let filter = LedgerFilter {
            stage_name: Some(StageName::Render),
            status: Some(LedgerStatus::Failed),
            ..LedgerFilter::default()
        };
        assert!(!filter.matches(&e));
    }
}
