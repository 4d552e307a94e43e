//! Wire format of queue messages. The shape is stable: collaborators in
//! other processes decode these payloads, so field names never change.

use serde::{Deserialize, Serialize};

/// A message on the job or task queue, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Drive orchestration of one stage of one job
    Job { job_id: String, stage: i32 },
    /// Execute one task
    Task { task_id: String },
}

impl QueueMessage {
    pub fn job(job_id: impl Into<String>, stage: i32) -> Self {
        Self::Job {
            job_id: job_id.into(),
            stage,
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        Self::Task {
            task_id: task_id.into(),
        }
    }
}
