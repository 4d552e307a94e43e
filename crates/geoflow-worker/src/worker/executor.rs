//! # Task Executor
//!
//! Executes one task per message: a compare-and-set claims the task (so
//! duplicate deliveries collapse into no-ops), the handler runs under a
//! timeout with panic capture, and the outcome is persisted through the
//! store's terminal writes. When the write reports zero remaining tasks
//! in the stage, this executor was elected to close it and runs the
//! stage-advance path before acknowledging anything.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use geoflow_orchestration::StageAdvancer;
use geoflow_shared::handler::{error_types, HandlerOutcome};
use geoflow_shared::models::{TaskRecord, TaskStatus};
use geoflow_shared::store::{MarkProcessingOutcome, TerminalWrite};
use geoflow_shared::{GeoflowResult, SystemContext};

/// What handling one task message amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler ran and its outcome was persisted
    Executed {
        terminal: TaskStatus,
        stage_closed: bool,
    },
    /// Duplicate delivery while another worker holds the task
    DuplicateDelivery,
    /// Late duplicate: the task was already terminal
    LateDuplicate,
    /// The terminal write lost to a reconciler reclaim; the reclaimed
    /// message will re-run the task
    WriteRejected,
    /// The message references no stored task
    Orphan,
}

/// Executes task messages against registered handlers
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    context: Arc<SystemContext>,
    advancer: StageAdvancer,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        let advancer = StageAdvancer::new(context.clone());
        Self { context, advancer }
    }

    /// Handle one task message `{task_id}`.
    ///
    /// Errors are infrastructure failures only; handler failures of any
    /// kind are persisted as the task's terminal state.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn process_task(&self, task_id: &str) -> GeoflowResult<ExecutionOutcome> {
        let store = self.context.store();

        let Some(task) = store.get_task(task_id).await? else {
            warn!("task message references no stored task");
            return Ok(ExecutionOutcome::Orphan);
        };

        match store.mark_task_processing(task_id).await? {
            MarkProcessingOutcome::Started => {}
            MarkProcessingOutcome::AlreadyProcessing => {
                debug!("duplicate delivery; task already executing");
                return Ok(ExecutionOutcome::DuplicateDelivery);
            }
            MarkProcessingOutcome::AlreadyTerminal => {
                debug!("late duplicate; task already terminal");
                return Ok(ExecutionOutcome::LateDuplicate);
            }
            MarkProcessingOutcome::NotFound => return Ok(ExecutionOutcome::Orphan),
        }

        let outcome = self.invoke_handler(&task).await;

        let write = match &outcome {
            HandlerOutcome::Success { result } => store.complete_task(task_id, result).await?,
            HandlerOutcome::Failure { error, error_type } => {
                store
                    .fail_task(task_id, error, error_type.as_deref())
                    .await?
            }
        };

        match write {
            TerminalWrite::Applied { remaining } => {
                let terminal = if outcome.is_success() {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                let stage_closed = remaining == 0;
                info!(status = %terminal, remaining, "task finished");
                if stage_closed {
                    self.advancer.close_stage(&task.job_id, task.stage).await?;
                }
                Ok(ExecutionOutcome::Executed {
                    terminal,
                    stage_closed,
                })
            }
            TerminalWrite::Rejected => {
                // A reconciler reclaimed the task mid-flight; its fresh
                // message owns the retry.
                warn!("terminal write rejected; task was reclaimed while executing");
                Ok(ExecutionOutcome::WriteRejected)
            }
        }
    }

    /// Terminate a poison task without executing it, then close its
    /// stage if that termination emptied it.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn poison_task(&self, task_id: &str) -> GeoflowResult<()> {
        let store = self.context.store();
        let Some(task) = store.get_task(task_id).await? else {
            return Ok(());
        };

        let write = store
            .fail_task(
                task_id,
                "message delivery attempts exhausted",
                Some(error_types::MAX_RETRIES_EXCEEDED),
            )
            .await?;
        if let TerminalWrite::Applied { remaining } = write {
            error!(remaining, "task failed as poison");
            if remaining == 0 {
                self.advancer.close_stage(&task.job_id, task.stage).await?;
            }
        }
        Ok(())
    }

    /// Run the handler with the workflow's timeout, converting panics
    /// and timeouts into failure outcomes at the boundary.
    async fn invoke_handler(&self, task: &TaskRecord) -> HandlerOutcome {
        let handler = match self.context.handler_registry().lookup(&task.task_type) {
            Ok(handler) => handler,
            Err(_) => {
                // Registries are validated at startup, so this means the
                // record predates a deployment that dropped the type.
                return HandlerOutcome::failure(
                    format!("no handler registered for task type '{}'", task.task_type),
                    error_types::UNKNOWN_TASK_TYPE,
                );
            }
        };

        let timeout = self.task_timeout(task).await;
        let invocation = AssertUnwindSafe(handler.call(task.parameters.clone())).catch_unwind();

        match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                error!(task_id = %task.task_id, "handler panicked");
                HandlerOutcome::failure(panic_message(&*panic), error_types::HANDLER_PANIC)
            }
            Err(_) => HandlerOutcome::failure(
                format!("handler exceeded {timeout:?} timeout"),
                error_types::TIMEOUT,
            ),
        }
    }

    /// The owning workflow's per-task timeout, falling back to the
    /// executor default when the job or workflow cannot be resolved.
    async fn task_timeout(&self, task: &TaskRecord) -> Duration {
        if let Ok(Some(job)) = self.context.store().get_job(&task.job_id).await {
            if let Ok(workflow) = self.context.job_registry().lookup(&job.job_type) {
                return workflow.task_timeout;
            }
        }
        self.context.config().executor.handler_timeout()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
