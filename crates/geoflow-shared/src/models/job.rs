//! # Job Records
//!
//! A [`JobRecord`] is one execution of a workflow with specific
//! parameters. Its `stage_results` map accumulates the ordered per-task
//! results of every closed stage, keyed by the stage number rendered as a
//! string (the map is persisted as JSONB).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::StageTaskResult;

/// Job lifecycle status
///
/// Transitions are monotonic: `Queued → Processing → {Completed | Failed |
/// CompletedWithErrors}`. Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    CompletedWithErrors,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::CompletedWithErrors
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED_WITH_ERRORS" => Ok(Self::CompletedWithErrors),
            other => Err(format!("unrecognized job status: {other}")),
        }
    }
}

/// Ordered per-task results of each closed stage, keyed by stage number
/// rendered as a string.
pub type StageResultMap = BTreeMap<String, Vec<StageTaskResult>>;

/// One submitted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Deterministic 64-hex-character identifier
    pub job_id: String,
    /// Key into the job registry
    pub job_type: String,
    pub status: JobStatus,
    /// Current stage, 1-based
    pub stage: i32,
    /// Fixed at submission from the workflow definition
    pub total_stages: i32,
    /// Validated submission payload
    pub parameters: Value,
    pub stage_results: StageResultMap,
    /// Final aggregated result, populated on terminal success
    pub result_data: Option<Value>,
    /// Populated on terminal failure
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh record ready for insertion: `QUEUED` at stage 1.
    pub fn new(
        job_id: impl Into<String>,
        job_type: impl Into<String>,
        parameters: Value,
        total_stages: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            status: JobStatus::Queued,
            stage: 1,
            total_stages,
            parameters,
            stage_results: StageResultMap::new(),
            result_data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Results of a previously closed stage, if recorded.
    #[must_use]
    pub fn stage_results_for(&self, stage: i32) -> Option<&[StageTaskResult]> {
        self.stage_results
            .get(&stage.to_string())
            .map(Vec::as_slice)
    }

    /// Count of failed task entries recorded across all closed stages.
    #[must_use]
    pub fn recorded_failures(&self) -> usize {
        self.stage_results
            .values()
            .flat_map(|results| results.iter())
            .filter(|r| r.is_failed())
            .count()
    }
}

/// Task-count progress across all stages created so far
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub percent: f64,
}

impl JobProgress {
    #[must_use]
    pub fn from_counts(completed: i64, failed: i64, total: i64) -> Self {
        let percent = if total > 0 {
            ((completed + failed) as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            completed,
            failed,
            total,
            percent,
        }
    }
}

/// Read model returned by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub stage: i32,
    pub total_stages: i32,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
