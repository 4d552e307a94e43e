//! # CoreMachine
//!
//! Processes job messages: activates queued jobs, fans the current stage
//! out into tasks, and enqueues a task message per runnable task. Every
//! step tolerates redelivery — activation is a compare-and-set, task
//! insertion skips existing ids, and only still-QUEUED tasks are
//! re-enqueued.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use geoflow_shared::handler::error_types;
use geoflow_shared::models::{JobRecord, JobStatus, TaskRecord, TaskStatus};
use geoflow_shared::workflow::StageContext;
use geoflow_shared::{ident, GeoflowResult, SystemContext};

/// What handling one job message amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMessageOutcome {
    /// The stage's tasks exist and were enqueued
    StageStarted { tasks_enqueued: usize },
    /// Idempotent no-op with reason (orphan, terminal, stale stage)
    Dropped(&'static str),
    /// The workflow itself misbehaved; the job was finalized FAILED
    JobFailed,
}

/// The job orchestrator
#[derive(Debug, Clone)]
pub struct CoreMachine {
    context: Arc<SystemContext>,
}

impl CoreMachine {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Handle one job message `{job_id, stage}`.
    ///
    /// Errors are infrastructure failures only; workflow misbehavior
    /// finalizes the job and returns `Ok(JobFailed)` so the message is
    /// acknowledged rather than redelivered into the same failure.
    #[instrument(skip(self), fields(job_id = %job_id, stage = stage))]
    pub async fn handle_job_message(
        &self,
        job_id: &str,
        stage: i32,
    ) -> GeoflowResult<JobMessageOutcome> {
        let store = self.context.store();

        let Some(job) = store.get_job(job_id).await? else {
            warn!("job message references no stored job; dropping");
            return Ok(JobMessageOutcome::Dropped("orphan message"));
        };

        if job.status.is_terminal() {
            debug!(status = %job.status, "job already terminal; dropping message");
            return Ok(JobMessageOutcome::Dropped("job terminal"));
        }

        if job.status == JobStatus::Queued {
            let activated = store
                .update_job_status(job_id, JobStatus::Queued, JobStatus::Processing)
                .await?;
            if !activated {
                // Lost the activation race; re-read to decide whether the
                // winner already drove the job to a terminal state.
                let current = store.get_job(job_id).await?;
                if current.map_or(true, |j| j.status.is_terminal()) {
                    return Ok(JobMessageOutcome::Dropped("job terminal"));
                }
            } else {
                info!("job activated");
            }
        }

        if job.stage != stage {
            debug!(
                current_stage = job.stage,
                "message stage does not match job stage; dropping stale delivery"
            );
            return Ok(JobMessageOutcome::Dropped("stale stage"));
        }

        self.start_stage(&job, stage).await
    }

    /// Fan a stage out into tasks and enqueue a message per runnable
    /// task. Shared by first activation and synthetic messages enqueued
    /// on stage advance.
    async fn start_stage(
        &self,
        job: &JobRecord,
        stage: i32,
    ) -> GeoflowResult<JobMessageOutcome> {
        let store = self.context.store();
        let queue = self.context.queue();

        let workflow = match self.context.job_registry().lookup(&job.job_type) {
            Ok(workflow) => workflow,
            Err(e) => {
                return self
                    .fail_workflow(&job.job_id, format!("job type not registered: {e}"))
                    .await;
            }
        };

        let Some(stage_def) = workflow.stage(stage) else {
            return self
                .fail_workflow(
                    &job.job_id,
                    format!("workflow {} has no stage {stage}", job.job_type),
                )
                .await;
        };

        let previous_results = if stage > 1 {
            match job.stage_results_for(stage - 1) {
                Some(results) => Some(results),
                None => {
                    return self
                        .fail_workflow(
                            &job.job_id,
                            format!("results of stage {} were never recorded", stage - 1),
                        )
                        .await;
                }
            }
        } else {
            None
        };

        let specs = match workflow.build_tasks_for_stage(&StageContext {
            stage: stage_def,
            job_id: &job.job_id,
            parameters: &job.parameters,
            previous_results,
        }) {
            Ok(specs) => specs,
            Err(reason) => return self.fail_workflow(&job.job_id, reason).await,
        };

        let records: Vec<TaskRecord> = specs
            .into_iter()
            .map(|spec| {
                TaskRecord::new(
                    ident::task_id(&job.job_id, stage, &spec.semantic_index),
                    &job.job_id,
                    stage,
                    &stage_def.task_type,
                    spec.parameters,
                )
            })
            .collect();

        let inserted = store.insert_tasks(&records).await?;
        debug!(
            inserted,
            declared = records.len(),
            "stage task set persisted"
        );

        // Enqueue whatever is still runnable, whether inserted now or
        // left over from an earlier delivery. Executed or in-flight
        // tasks are skipped; the executor's compare-and-set absorbs any
        // duplicates this still produces.
        let mut enqueued = 0;
        for task in store.get_stage_tasks(&job.job_id, stage).await? {
            if task.status == TaskStatus::Queued {
                queue.enqueue_task(&task.task_id).await?;
                enqueued += 1;
            }
        }

        info!(stage, enqueued, "stage started");
        Ok(JobMessageOutcome::StageStarted {
            tasks_enqueued: enqueued,
        })
    }

    /// Terminal path for workflow misbehavior: the job is finalized
    /// FAILED and the message is treated as handled.
    async fn fail_workflow(
        &self,
        job_id: &str,
        reason: String,
    ) -> GeoflowResult<JobMessageOutcome> {
        error!(reason = %reason, "workflow error; finalizing job as FAILED");
        let message = format!("[{}] {reason}", error_types::WORKFLOW_ERROR);
        let finalized = self
            .context
            .store()
            .finalize_job(job_id, JobStatus::Failed, None, Some(&message), None)
            .await?;
        if !finalized {
            warn!("job was no longer PROCESSING when the workflow error was recorded");
        }
        Ok(JobMessageOutcome::JobFailed)
    }
}
