//! # Reconciler
//!
//! Periodic repair of state stranded by worker crashes. Three sweeps:
//!
//! 1. PROCESSING tasks whose lease expired are requeued and re-enqueued,
//!    or failed with `MaxRetriesExceeded` once their retries are spent —
//!    running the stage-closure path when that termination empties the
//!    stage.
//! 2. QUEUED jobs older than the lease get their job message re-sent
//!    (submission crashed between insert and enqueue).
//! 3. PROCESSING jobs older than the lease are inspected: a current
//!    stage with no tasks gets its job message re-sent (fan-out never
//!    ran); a fully terminal stage gets the closure path re-run (the
//!    elected closer died before advancing).
//!
//! Every repair goes through the same compare-and-set operations as the
//! happy path, so a sweep racing a live worker is harmless.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use geoflow_shared::handler::error_types;
use geoflow_shared::models::JobStatus;
use geoflow_shared::store::TerminalWrite;
use geoflow_shared::{GeoflowResult, SystemContext};

use super::stage_advancer::{StageAdvancer, StageOutcome};

/// Counters from one sweep, for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tasks_requeued: usize,
    pub tasks_failed: usize,
    pub stages_closed: usize,
    pub jobs_nudged: usize,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Background repair loop
#[derive(Debug, Clone)]
pub struct Reconciler {
    context: Arc<SystemContext>,
    advancer: StageAdvancer,
}

impl Reconciler {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        let advancer = StageAdvancer::new(context.clone());
        Self { context, advancer }
    }

    /// Run sweeps forever at the configured interval.
    pub async fn run(&self) -> GeoflowResult<()> {
        let mut ticker = tokio::time::interval(self.context.config().reconciler.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        tasks_requeued = report.tasks_requeued,
                        tasks_failed = report.tasks_failed,
                        stages_closed = report.stages_closed,
                        jobs_nudged = report.jobs_nudged,
                        "reconciler repaired stranded state"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reconciler sweep failed"),
            }
        }
    }

    /// One full sweep over stale tasks and stalled jobs.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> GeoflowResult<SweepReport> {
        let mut report = SweepReport::default();
        self.sweep_stale_tasks(&mut report).await?;
        self.sweep_stalled_jobs(&mut report).await?;
        Ok(report)
    }

    async fn sweep_stale_tasks(&self, report: &mut SweepReport) -> GeoflowResult<()> {
        let store = self.context.store();
        let queue = self.context.queue();
        let reconciler_config = &self.context.config().reconciler;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(reconciler_config.lease())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stale = store
            .find_stale_processing_tasks(cutoff, reconciler_config.sweep_limit)
            .await?;
        for task in stale {
            if task.retry_count >= reconciler_config.max_retries {
                warn!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count,
                    "task lease expired with retries exhausted; failing"
                );
                let write = store
                    .fail_task(
                        &task.task_id,
                        "task lease expired after maximum retries",
                        Some(error_types::MAX_RETRIES_EXCEEDED),
                    )
                    .await?;
                if let TerminalWrite::Applied { remaining } = write {
                    report.tasks_failed += 1;
                    if remaining == 0 {
                        self.close_stage(&task.job_id, task.stage, report).await?;
                    }
                }
            } else if store.requeue_task(&task.task_id).await? {
                warn!(
                    task_id = %task.task_id,
                    retry_count = task.retry_count + 1,
                    "task lease expired; requeued"
                );
                queue.enqueue_task(&task.task_id).await?;
                report.tasks_requeued += 1;
            }
        }
        Ok(())
    }

    async fn sweep_stalled_jobs(&self, report: &mut SweepReport) -> GeoflowResult<()> {
        let store = self.context.store();
        let queue = self.context.queue();
        let reconciler_config = &self.context.config().reconciler;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(reconciler_config.lease())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        // Jobs inserted but never enqueued
        let queued = store
            .find_jobs_by_status_older_than(
                JobStatus::Queued,
                cutoff,
                reconciler_config.sweep_limit,
            )
            .await?;
        for job in queued {
            warn!(job_id = %job.job_id, "queued job has no live message; re-enqueueing");
            queue.enqueue_job(&job.job_id, job.stage).await?;
            report.jobs_nudged += 1;
        }

        // Jobs whose current stage stopped moving
        let processing = store
            .find_jobs_by_status_older_than(
                JobStatus::Processing,
                cutoff,
                reconciler_config.sweep_limit,
            )
            .await?;
        for job in processing {
            let tasks = store.get_stage_tasks(&job.job_id, job.stage).await?;
            if tasks.is_empty() {
                // Advanced (or activated) but fan-out never ran
                warn!(
                    job_id = %job.job_id,
                    stage = job.stage,
                    "processing job has no tasks for its stage; re-enqueueing"
                );
                queue.enqueue_job(&job.job_id, job.stage).await?;
                report.jobs_nudged += 1;
            } else if tasks.iter().all(|t| t.status.is_terminal()) {
                // The elected closer died before advancing
                warn!(
                    job_id = %job.job_id,
                    stage = job.stage,
                    "stage is fully terminal but job never advanced; closing"
                );
                self.close_stage(&job.job_id, job.stage, report).await?;
            }
        }
        Ok(())
    }

    async fn close_stage(
        &self,
        job_id: &str,
        stage: i32,
        report: &mut SweepReport,
    ) -> GeoflowResult<()> {
        match self.advancer.close_stage(job_id, stage).await? {
            StageOutcome::Advanced { .. } | StageOutcome::Finalized { .. } => {
                report.stages_closed += 1;
            }
            StageOutcome::NoAction(_) => {}
        }
        Ok(())
    }
}
