//! # Task Records
//!
//! A [`TaskRecord`] is one unit of work within a stage. Task identifiers
//! are deterministic (`<job prefix>_s<stage>_<semantic index>`), which is
//! what makes redelivered fan-out idempotent: re-inserting an existing
//! task id is a no-op.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unrecognized task status: {other}")),
        }
    }
}

/// One task within a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Deterministic identifier: `<job prefix>_s<stage>_<semantic index>`
    pub task_id: String,
    pub job_id: String,
    pub stage: i32,
    /// Key into the handler registry
    pub task_type: String,
    pub status: TaskStatus,
    /// Payload handed to the handler
    pub parameters: Value,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub retry_count: i32,
    /// Stamped when execution starts; used for long-running detection
    pub heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Build a fresh record ready for insertion: `QUEUED`, zero retries.
    pub fn new(
        task_id: impl Into<String>,
        job_id: impl Into<String>,
        stage: i32,
        task_type: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            job_id: job_id.into(),
            stage,
            task_type: task_type.into(),
            status: TaskStatus::Queued,
            parameters,
            result_data: None,
            error_message: None,
            error_type: None,
            retry_count: 0,
            heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-task entry recorded into a job's `stage_results` when a stage
/// closes. Entries are ordered by `task_id` ascending for determinism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl StageTaskResult {
    #[must_use]
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            status: record.status,
            result: record.result_data.clone(),
            error: record.error_message.clone(),
            error_type: record.error_type.clone(),
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn stage_result_omits_empty_fields_on_the_wire() {
        let mut record = TaskRecord::new("ab_s1_0", "job", 1, "noop", json!({}));
        record.status = TaskStatus::Completed;
        record.result_data = Some(json!({"rows": 3}));

        let entry = StageTaskResult::from_record(&record);
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(wire["status"], "COMPLETED");
        assert_eq!(wire["result"]["rows"], 3);
        assert!(wire.get("error").is_none());
        assert!(wire.get("error_type").is_none());
    }

    #[test]
    fn failed_entries_are_detected() {
        let mut record = TaskRecord::new("ab_s1_0", "job", 1, "noop", json!({}));
        record.status = TaskStatus::Failed;
        record.error_message = Some("bad row".into());
        let entry = StageTaskResult::from_record(&record);
        assert!(entry.is_failed());
        assert!(entry.is_terminal());
    }
}
