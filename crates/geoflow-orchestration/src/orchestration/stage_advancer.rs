//! # Stage Advancer
//!
//! The closure path that runs when a stage's last task reaches a
//! terminal status. Whoever observes `remaining == 0` from a terminal
//! task write calls [`StageAdvancer::close_stage`]; the reconciler calls
//! the same path for jobs stranded by a crash. Every write in here is a
//! compare-and-set whose predicate includes the current stage, so a
//! duplicate closure attempt is rejected by the store, never applied
//! twice.
//!
//! Advancing enqueues a synthetic job message for the next stage instead
//! of fanning out inline: the orchestrator stays uniform and a crash
//! between the advance and the fan-out is healed by normal message
//! redelivery plus the reconciler.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use geoflow_shared::handler::error_types;
use geoflow_shared::models::{JobRecord, JobStatus, StageTaskResult};
use geoflow_shared::workflow::{FailurePolicy, WorkflowDefinition};
use geoflow_shared::{GeoflowError, GeoflowResult, SystemContext};

/// What closing a stage amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The job moved to the next stage and its job message was enqueued
    Advanced { next_stage: i32 },
    /// The job reached a terminal status
    Finalized { status: JobStatus },
    /// Idempotent no-op with reason (late duplicate, lost race, live
    /// tasks still present)
    NoAction(&'static str),
}

/// Drives stage advancement and terminal transitions
#[derive(Debug, Clone)]
pub struct StageAdvancer {
    context: Arc<SystemContext>,
}

impl StageAdvancer {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Close `stage` of `job_id`: record its results, then either
    /// advance the job or finalize it.
    ///
    /// Safe to call redundantly; only the caller whose compare-and-set
    /// wins performs any state change.
    #[instrument(skip(self), fields(job_id = %job_id, stage = stage))]
    pub async fn close_stage(&self, job_id: &str, stage: i32) -> GeoflowResult<StageOutcome> {
        let store = self.context.store();

        let Some(job) = store.get_job(job_id).await? else {
            warn!("stage closure for unknown job; dropping");
            return Ok(StageOutcome::NoAction("job missing"));
        };
        if job.status.is_terminal() {
            debug!(status = %job.status, "job already terminal");
            return Ok(StageOutcome::NoAction("job terminal"));
        }
        if job.stage != stage {
            debug!(current_stage = job.stage, "stage already advanced");
            return Ok(StageOutcome::NoAction("stage already advanced"));
        }

        let results = store.load_stage_task_results(job_id, stage).await?;
        if results.is_empty() {
            // Closure is only triggered after a terminal task write, so
            // an empty stage means the caller raced a workflow failure.
            warn!("stage closure found no recorded tasks");
            return Ok(StageOutcome::NoAction("no tasks recorded"));
        }
        if results.iter().any(|r| !r.is_terminal()) {
            // Reconciler path: the stage filled back up (a reclaimed task
            // went back to QUEUED). Not actually closable.
            return Ok(StageOutcome::NoAction("stage has live tasks"));
        }

        let workflow = match self.context.job_registry().lookup(&job.job_type) {
            Ok(workflow) => workflow,
            Err(e) => {
                return self
                    .finalize_failed(&job, format!("job type not registered: {e}"), stage, &results)
                    .await;
            }
        };

        let failed = results.iter().filter(|r| r.is_failed()).count();
        let fail_fast = workflow
            .stage(stage)
            .map(|s| s.failure_policy == FailurePolicy::FailFast)
            .unwrap_or(true);

        if failed > 0 && fail_fast {
            let message = failure_message(&results, failed);
            info!(failed, "stage closed with failures under fail-fast policy");
            return self.finalize_failed(&job, message, stage, &results).await;
        }

        if stage < job.total_stages {
            return self.advance(&job, stage, &results).await;
        }
        self.finalize_terminal(&job, &workflow, stage, &results, failed)
            .await
    }

    async fn advance(
        &self,
        job: &JobRecord,
        stage: i32,
        results: &[StageTaskResult],
    ) -> GeoflowResult<StageOutcome> {
        let next_stage = stage + 1;
        let advanced = self
            .context
            .store()
            .advance_job_stage(&job.job_id, stage, next_stage, results)
            .await?;
        if !advanced {
            debug!("another closer advanced this stage first");
            return Ok(StageOutcome::NoAction("advance lost race"));
        }

        self.context
            .queue()
            .enqueue_job(&job.job_id, next_stage)
            .await?;
        info!(next_stage, "job advanced");
        Ok(StageOutcome::Advanced { next_stage })
    }

    /// Terminal transition for the final stage: aggregate results and
    /// pick COMPLETED or COMPLETED_WITH_ERRORS.
    async fn finalize_terminal(
        &self,
        job: &JobRecord,
        workflow: &WorkflowDefinition,
        stage: i32,
        results: &[StageTaskResult],
        failed_in_final_stage: usize,
    ) -> GeoflowResult<StageOutcome> {
        // The aggregator sees the job as it will be persisted, final
        // stage included.
        let mut aggregated_view = job.clone();
        aggregated_view
            .stage_results
            .insert(stage.to_string(), results.to_vec());

        let result_data: Value = match workflow.aggregate_results(&aggregated_view) {
            Some(Ok(value)) => value,
            Some(Err(reason)) => {
                error!(reason = %reason, "result aggregation failed");
                return self
                    .finalize_failed(job, format!("aggregation failed: {reason}"), stage, results)
                    .await;
            }
            None => serde_json::to_value(results).map_err(GeoflowError::from)?,
        };

        let total_failed = aggregated_view.recorded_failures();
        let status = if total_failed == 0 {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        let error_message = (total_failed > 0).then(|| {
            failure_summary(
                aggregated_view.stage_results.values().flatten(),
                total_failed,
            )
        });

        let finalized = self
            .context
            .store()
            .finalize_job(
                &job.job_id,
                status,
                Some(&result_data),
                error_message.as_deref(),
                Some((stage, results)),
            )
            .await?;
        if !finalized {
            debug!("another closer finalized this job first");
            return Ok(StageOutcome::NoAction("finalize lost race"));
        }

        info!(status = %status, failed_in_final_stage, "job finalized");
        Ok(StageOutcome::Finalized { status })
    }

    async fn finalize_failed(
        &self,
        job: &JobRecord,
        message: String,
        stage: i32,
        results: &[StageTaskResult],
    ) -> GeoflowResult<StageOutcome> {
        let finalized = self
            .context
            .store()
            .finalize_job(
                &job.job_id,
                JobStatus::Failed,
                None,
                Some(&message),
                Some((stage, results)),
            )
            .await?;
        if !finalized {
            debug!("another closer finalized this job first");
            return Ok(StageOutcome::NoAction("finalize lost race"));
        }
        info!("job finalized as FAILED");
        Ok(StageOutcome::Finalized {
            status: JobStatus::Failed,
        })
    }
}

/// Error summary for the job record: the first failure plus a count.
fn failure_message(results: &[StageTaskResult], failed: usize) -> String {
    failure_summary(results.iter(), failed)
}

fn failure_summary<'a>(
    mut entries: impl Iterator<Item = &'a StageTaskResult>,
    failed: usize,
) -> String {
    let first = entries.find(|r| r.is_failed());
    match first {
        Some(entry) => {
            let error_type = entry
                .error_type
                .as_deref()
                .unwrap_or(error_types::WORKFLOW_ERROR);
            let error = entry.error.as_deref().unwrap_or("unknown error");
            format!("{failed} task(s) failed; first: [{error_type}] {error}")
        }
        None => format!("{failed} task(s) failed"),
    }
}
