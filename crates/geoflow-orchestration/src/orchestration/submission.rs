//! # Job Submission and Status
//!
//! The synchronous entry points HTTP collaborators call into. Submission
//! is idempotent end to end: parameters are validated and normalized,
//! the job id is derived from the normalized payload, and an existing
//! record is returned untouched when the same submission arrives twice.

use std::sync::Arc;

use tracing::{info, instrument};

use geoflow_shared::errors::SubmissionError;
use geoflow_shared::models::{JobProgress, JobRecord, JobStatus, JobStatusView};
use geoflow_shared::{ident, SystemContext};

/// Result of one submission call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub already_existed: bool,
}

/// Submission and status façade over the orchestration core
#[derive(Debug, Clone)]
pub struct SubmissionService {
    context: Arc<SystemContext>,
}

impl SubmissionService {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Submit a job of `job_type` with `parameters`.
    ///
    /// Validates the type and payload, derives the deterministic job id,
    /// inserts the record unless it exists, and enqueues the first job
    /// message. Resubmitting an identical payload returns the existing
    /// record with `already_existed = true`; if that record is still
    /// QUEUED its job message is re-sent, which heals a crash between
    /// insertion and the original enqueue (duplicates are harmless under
    /// at-least-once delivery).
    #[instrument(skip(self, parameters), fields(job_type = %job_type))]
    pub async fn submit_job(
        &self,
        job_type: &str,
        parameters: &serde_json::Value,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let workflow = self
            .context
            .job_registry()
            .lookup(job_type)
            .map_err(|_| SubmissionError::UnknownJobType(job_type.to_string()))?;

        let normalized = workflow.parameters_schema.validate(parameters)?;
        let job_id = ident::job_id(job_type, &normalized);

        let record = JobRecord::new(&job_id, job_type, normalized, workflow.total_stages());
        let (stored, inserted) = self
            .context
            .store()
            .insert_job_if_absent(&record)
            .await
            .map_err(|e| SubmissionError::StoreUnavailable(e.to_string()))?;

        if stored.status == JobStatus::Queued {
            self.context
                .queue()
                .enqueue_job(&job_id, stored.stage)
                .await
                .map_err(|e| SubmissionError::QueueUnavailable(e.to_string()))?;
        }

        if inserted {
            info!(job_id = %job_id, "job submitted");
        }
        Ok(SubmissionReceipt {
            job_id,
            status: stored.status,
            already_existed: !inserted,
        })
    }

    /// Current status view for a job, or `None` if the id is unknown.
    pub async fn get_job_status(
        &self,
        job_id: &str,
    ) -> Result<Option<JobStatusView>, SubmissionError> {
        let store = self.context.store();
        let Some(job) = store
            .get_job(job_id)
            .await
            .map_err(|e| SubmissionError::StoreUnavailable(e.to_string()))?
        else {
            return Ok(None);
        };

        let counts = store
            .task_progress(job_id)
            .await
            .map_err(|e| SubmissionError::StoreUnavailable(e.to_string()))?;

        Ok(Some(JobStatusView {
            job_id: job.job_id,
            job_type: job.job_type,
            status: job.status,
            stage: job.stage,
            total_stages: job.total_stages,
            progress: JobProgress::from_counts(counts.completed, counts.failed, counts.total),
            result_data: job.result_data,
            error_message: job.error_message,
        }))
    }
}
