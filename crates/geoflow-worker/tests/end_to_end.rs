//! End-to-end scenarios through the full engine: submission →
//! orchestrator fan-out → executor → stage closure → terminal status,
//! all over in-memory infrastructure driven by the real processors.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use geoflow_orchestration::{Reconciler, SubmissionService};
use geoflow_shared::handler::error_types;
use geoflow_shared::models::{JobStatus, TaskStatus};
use geoflow_shared::registry::HandlerRegistry;
use geoflow_shared::{ident, SystemContext};
use geoflow_worker::{ExecutionOutcome, TaskExecutor, TaskQueueProcessor};

use support::{
    counting_handler, csv_handlers, greet_handler, hello_workflow, process_csv_workflow, pump,
    test_context,
};

async fn hello_context() -> Result<Arc<SystemContext>> {
    let mut handlers = HandlerRegistry::new();
    handlers.register("greet", greet_handler())?;
    test_context(vec![hello_workflow()], handlers).await
}

async fn csv_context(tolerant: bool) -> Result<Arc<SystemContext>> {
    let mut handlers = HandlerRegistry::new();
    csv_handlers(&mut handlers)?;
    test_context(vec![process_csv_workflow(tolerant)], handlers).await
}

#[tokio::test]
async fn hello_world_runs_to_completion() -> Result<()> {
    let context = hello_context().await?;
    let submission = SubmissionService::new(context.clone());

    let receipt = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;
    assert_eq!(receipt.status, JobStatus::Queued);
    assert_eq!(
        receipt.job_id,
        ident::job_id("hello", &json!({"name": "Ada"}))
    );

    pump(&context).await?;

    let view = submission.get_job_status(&receipt.job_id).await?.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.result_data.unwrap(), json!({"greeting": "hi Ada"}));
    assert_eq!(view.progress.completed, 1);
    assert_eq!(view.progress.total, 1);
    Ok(())
}

#[tokio::test]
async fn fan_out_fan_in_pipeline_aggregates_through_lineage() -> Result<()> {
    let context = csv_context(false).await?;
    let submission = SubmissionService::new(context.clone());

    let receipt = submission
        .submit_job("process_csv", &json!({"chunk_count": 3}))
        .await?;
    pump(&context).await?;

    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data.clone().unwrap(), json!({"rows_uploaded": 300}));

    // 1 extract + 3 validate + 1 load
    let counts = context.store().task_progress(&receipt.job_id).await?;
    assert_eq!(counts.total, 5);
    assert_eq!(counts.completed, 5);

    // middle-stage results are recorded ordered by task id
    let validate_results = job.stage_results_for(2).unwrap();
    assert_eq!(validate_results.len(), 3);
    let ids: Vec<&str> = validate_results.iter().map(|r| r.task_id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    for entry in validate_results {
        assert_eq!(entry.result.as_ref().unwrap()["valid_rows"], 100);
    }
    Ok(())
}

#[tokio::test]
async fn duplicate_deliveries_execute_the_handler_once() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("greet", counting_handler(counter.clone()))?;
    let context = test_context(vec![hello_workflow()], handlers).await?;

    let submission = SubmissionService::new(context.clone());
    let receipt = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;

    // activate and fan out, but do not run the task yet
    geoflow_orchestration::JobQueueProcessor::new(context.clone())
        .process_batch()
        .await?;
    let task_id = format!("{}_s1_0", &receipt.job_id[..16]);

    // ten concurrent deliveries of the same task
    let executor = TaskExecutor::new(context.clone());
    let attempts = futures::future::join_all(
        (0..10).map(|_| {
            let executor = executor.clone();
            let task_id = task_id.clone();
            async move { executor.process_task(&task_id).await }
        }),
    )
    .await;

    let executed = attempts
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|o| matches!(o, ExecutionOutcome::Executed { .. }))
        .count();
    assert_eq!(executed, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let task = context.store().get_task(&task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // the stage closed exactly once and the job is terminal
    pump(&context).await?;
    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn fail_fast_stops_the_pipeline() -> Result<()> {
    let context = csv_context(false).await?;
    let submission = SubmissionService::new(context.clone());

    let receipt = submission
        .submit_job(
            "process_csv",
            &json!({"chunk_count": 4, "fail_chunks": {"2": true}}),
        )
        .await?;
    pump(&context).await?;

    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.as_deref().unwrap();
    assert!(message.contains("bad row"));
    assert!(message.contains("ValidationError"));

    // the load stage never materialized
    assert!(context.store().get_stage_tasks(&receipt.job_id, 3).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn tolerant_stage_completes_with_errors() -> Result<()> {
    let context = csv_context(true).await?;
    let submission = SubmissionService::new(context.clone());

    let receipt = submission
        .submit_job(
            "process_csv",
            &json!({"chunk_count": 4, "fail_chunks": {"2": true}}),
        )
        .await?;
    pump(&context).await?;

    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert!(job.error_message.as_deref().unwrap().contains("bad row"));

    // three healthy chunks of 100 rows made it through
    assert_eq!(job.result_data.unwrap(), json!({"rows_uploaded": 300}));
    assert_eq!(context.store().get_stage_tasks(&receipt.job_id, 3).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn crashed_stage_closer_is_healed_by_the_reconciler() -> Result<()> {
    // Control run: the same submission through the normal path.
    let control = csv_context(false).await?;
    let control_receipt = SubmissionService::new(control.clone())
        .submit_job("process_csv", &json!({"chunk_count": 2}))
        .await?;
    pump(&control).await?;
    let control_job = control.store().get_job(&control_receipt.job_id).await?.unwrap();

    // Crash run: stage 1's task completes through the store, but the
    // elected closer dies before advancing.
    let crashed = csv_context(false).await?;
    let receipt = SubmissionService::new(crashed.clone())
        .submit_job("process_csv", &json!({"chunk_count": 2}))
        .await?;
    geoflow_orchestration::JobQueueProcessor::new(crashed.clone())
        .process_batch()
        .await?;

    let task_id = format!("{}_s1_0", &receipt.job_id[..16]);
    crashed.store().mark_task_processing(&task_id).await?;
    crashed
        .store()
        .complete_task(&task_id, &json!({"total_rows": 200, "temp_path": "/t/f"}))
        .await?;
    // drain the task message the dead worker held
    for message in crashed
        .queue()
        .receive_tasks(Duration::ZERO, 10)
        .await?
    {
        crashed.queue().ack(&message.receipt).await?;
    }

    let job = crashed.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.stage, 1);

    // the reconciler performs the advance, then normal processing resumes
    let report = Reconciler::new(crashed.clone()).sweep_once().await?;
    assert_eq!(report.stages_closed, 1);
    pump(&crashed).await?;

    let healed_job = crashed.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(healed_job.status, JobStatus::Completed);
    assert_eq!(healed_job.job_id, control_job.job_id);
    assert_eq!(healed_job.result_data, control_job.result_data);
    assert_eq!(healed_job.stage_results, control_job.stage_results);
    Ok(())
}

#[tokio::test]
async fn poison_task_messages_are_quarantined_and_fail_the_task() -> Result<()> {
    let context = hello_context().await?;
    let submission = SubmissionService::new(context.clone());
    let receipt = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;

    geoflow_orchestration::JobQueueProcessor::new(context.clone())
        .process_batch()
        .await?;
    let task_id = format!("{}_s1_0", &receipt.job_id[..16]);

    // burn through the delivery budget without ever acknowledging
    let max_attempts = context.config().queues.max_delivery_attempts;
    for _ in 0..max_attempts {
        let deliveries = context.queue().receive_tasks(Duration::ZERO, 10).await?;
        assert!(!deliveries.is_empty());
    }

    // the next delivery is past the budget: poison
    TaskQueueProcessor::new(context.clone()).process_batch().await?;

    let task = context.store().get_task(&task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.error_type.as_deref(),
        Some(error_types::MAX_RETRIES_EXCEEDED)
    );

    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn worker_crash_is_retried_via_lease_reclaim() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("greet", counting_handler(counter.clone()))?;
    let context = test_context(vec![hello_workflow()], handlers).await?;

    let submission = SubmissionService::new(context.clone());
    let receipt = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;
    geoflow_orchestration::JobQueueProcessor::new(context.clone())
        .process_batch()
        .await?;

    // a worker leased the task, marked it PROCESSING, and died
    let task_id = format!("{}_s1_0", &receipt.job_id[..16]);
    context.store().mark_task_processing(&task_id).await?;
    for message in context.queue().receive_tasks(Duration::ZERO, 10).await? {
        context.queue().ack(&message.receipt).await?;
    }

    let report = Reconciler::new(context.clone()).sweep_once().await?;
    assert_eq!(report.tasks_requeued, 1);

    pump(&context).await?;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let job = context.store().get_job(&receipt.job_id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let task = context.store().get_task(&task_id).await?.unwrap();
    assert_eq!(task.retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn submitting_while_running_does_not_duplicate_work() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("greet", counting_handler(counter.clone()))?;
    let context = test_context(vec![hello_workflow()], handlers).await?;

    let submission = SubmissionService::new(context.clone());
    let first = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;
    let second = submission
        .submit_job("hello", &json!({"name": "Ada"}))
        .await?;
    assert!(second.already_existed);

    pump(&context).await?;
    // duplicate job messages collapsed; the handler still ran once
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let view = submission.get_job_status(&first.job_id).await?.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    Ok(())
}
