//! # State Store
//!
//! The durable home of all job and task records, and the only
//! coordination primitive in the system: `complete_task` / `fail_task`
//! atomically write the terminal status *and* return the remaining count
//! of non-terminal tasks for the task's `(job_id, stage)`. The store
//! serializes those two operations per job, so under arbitrary
//! concurrent completions exactly one caller observes `remaining == 0`
//! and inherits responsibility for closing the stage.
//!
//! All status updates are compare-and-set: a write that does not find
//! the expected current state is rejected, never applied. Duplicate
//! message deliveries therefore collapse into no-ops.
//!
//! Like the messaging layer, the store is an enum over concrete
//! backends: PostgreSQL in production, an in-memory twin for the test
//! harness.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StageTaskResult, TaskRecord};

pub use memory::InMemoryStateStore;
pub use postgres::PgStateStore;

/// Result of the `mark_task_processing` compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkProcessingOutcome {
    /// The task was QUEUED and is now PROCESSING
    Started,
    /// Duplicate delivery: another worker is already executing it
    AlreadyProcessing,
    /// Late duplicate: the task already reached a terminal status
    AlreadyTerminal,
    NotFound,
}

/// Result of a terminal task write (`complete_task` / `fail_task`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    /// The write was applied; `remaining` is the post-update count of
    /// non-terminal tasks in the task's stage. Zero elects the caller to
    /// close the stage.
    Applied { remaining: i64 },
    /// The compare-and-set found an unexpected current status
    Rejected,
}

impl TerminalWrite {
    /// Whether this write elected the caller to close the stage.
    #[must_use]
    pub fn closes_stage(&self) -> bool {
        matches!(self, Self::Applied { remaining: 0 })
    }
}

/// Task counts across all stages of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// The state store in use
#[derive(Debug, Clone)]
pub enum StateStore {
    Postgres(PgStateStore),
    InMemory(InMemoryStateStore),
}

impl StateStore {
    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::Postgres(PgStateStore::new(pool))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryStateStore::new())
    }

    /// Insert a job unless its deterministic id already exists. Returns
    /// the stored record and whether this call inserted it.
    pub async fn insert_job_if_absent(
        &self,
        record: &JobRecord,
    ) -> Result<(JobRecord, bool), StoreError> {
        match self {
            Self::Postgres(s) => s.insert_job_if_absent(record).await,
            Self::InMemory(s) => s.insert_job_if_absent(record),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        match self {
            Self::Postgres(s) => s.get_job(job_id).await,
            Self::InMemory(s) => s.get_job(job_id),
        }
    }

    /// CAS on job status; returns whether the transition was applied.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(s) => s.update_job_status(job_id, from, to).await,
            Self::InMemory(s) => s.update_job_status(job_id, from, to),
        }
    }

    /// Idempotent batch insert; existing task ids are skipped. Returns
    /// the number of rows actually inserted.
    pub async fn insert_tasks(&self, tasks: &[TaskRecord]) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(s) => s.insert_tasks(tasks).await,
            Self::InMemory(s) => s.insert_tasks(tasks),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        match self {
            Self::Postgres(s) => s.get_task(task_id).await,
            Self::InMemory(s) => s.get_task(task_id),
        }
    }

    /// All tasks of one stage, ordered by task id.
    pub async fn get_stage_tasks(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        match self {
            Self::Postgres(s) => s.get_stage_tasks(job_id, stage).await,
            Self::InMemory(s) => s.get_stage_tasks(job_id, stage),
        }
    }

    /// CAS QUEUED → PROCESSING; stamps the heartbeat on success.
    pub async fn mark_task_processing(
        &self,
        task_id: &str,
    ) -> Result<MarkProcessingOutcome, StoreError> {
        match self {
            Self::Postgres(s) => s.mark_task_processing(task_id).await,
            Self::InMemory(s) => s.mark_task_processing(task_id),
        }
    }

    /// CAS PROCESSING → COMPLETED plus the stage's remaining count, in
    /// one serialized critical section.
    pub async fn complete_task(
        &self,
        task_id: &str,
        result: &Value,
    ) -> Result<TerminalWrite, StoreError> {
        match self {
            Self::Postgres(s) => s.complete_task(task_id, result).await,
            Self::InMemory(s) => s.complete_task(task_id, result),
        }
    }

    /// CAS non-terminal → FAILED plus the stage's remaining count.
    /// Unlike completion, failure is accepted from QUEUED as well so
    /// poison messages can be terminated without a lease.
    pub async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        error_type: Option<&str>,
    ) -> Result<TerminalWrite, StoreError> {
        match self {
            Self::Postgres(s) => s.fail_task(task_id, error, error_type).await,
            Self::InMemory(s) => s.fail_task(task_id, error, error_type),
        }
    }

    /// Per-task results of one stage, ordered by task id ascending.
    pub async fn load_stage_task_results(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<StageTaskResult>, StoreError> {
        match self {
            Self::Postgres(s) => s.load_stage_task_results(job_id, stage).await,
            Self::InMemory(s) => s.load_stage_task_results(job_id, stage),
        }
    }

    /// CAS `(stage == from_stage, status == PROCESSING)` → `to_stage`,
    /// recording the closed stage's results. Returns whether this caller
    /// won the advance.
    pub async fn advance_job_stage(
        &self,
        job_id: &str,
        from_stage: i32,
        to_stage: i32,
        stage_results: &[StageTaskResult],
    ) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(s) => {
                s.advance_job_stage(job_id, from_stage, to_stage, stage_results)
                    .await
            }
            Self::InMemory(s) => s.advance_job_stage(job_id, from_stage, to_stage, stage_results),
        }
    }

    /// CAS PROCESSING → a terminal status, with final results or error
    /// and optionally the final stage's recorded results.
    pub async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&Value>,
        error_message: Option<&str>,
        final_stage_results: Option<(i32, &[StageTaskResult])>,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(s) => {
                s.finalize_job(job_id, status, result_data, error_message, final_stage_results)
                    .await
            }
            Self::InMemory(s) => {
                s.finalize_job(job_id, status, result_data, error_message, final_stage_results)
            }
        }
    }

    /// Terminal/total task counts for progress reporting.
    pub async fn task_progress(&self, job_id: &str) -> Result<TaskCounts, StoreError> {
        match self {
            Self::Postgres(s) => s.task_progress(job_id).await,
            Self::InMemory(s) => s.task_progress(job_id),
        }
    }

    /// PROCESSING tasks whose lease (heartbeat, falling back to
    /// updated_at) expired before `cutoff`.
    pub async fn find_stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        match self {
            Self::Postgres(s) => s.find_stale_processing_tasks(cutoff, limit).await,
            Self::InMemory(s) => s.find_stale_processing_tasks(cutoff, limit),
        }
    }

    /// CAS PROCESSING → QUEUED with a retry-count bump, clearing the
    /// heartbeat. Used by the reconciler to reclaim crashed executions.
    pub async fn requeue_task(&self, task_id: &str) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(s) => s.requeue_task(task_id).await,
            Self::InMemory(s) => s.requeue_task(task_id),
        }
    }

    /// Jobs in `status` whose updated_at is older than `cutoff`.
    pub async fn find_jobs_by_status_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        match self {
            Self::Postgres(s) => s.find_jobs_by_status_older_than(status, cutoff, limit).await,
            Self::InMemory(s) => s.find_jobs_by_status_older_than(status, cutoff, limit),
        }
    }
}
