//! End-to-end smoke binary: runs a small fan-out workflow through the
//! real orchestrator, executor, and reconciler over in-memory
//! infrastructure, then prints the terminal job view. Useful for
//! eyeballing the engine without PostgreSQL.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

use geoflow_orchestration::{JobQueueProcessor, SubmissionService};
use geoflow_shared::config::GeoflowConfig;
use geoflow_shared::handler::{sync_handler, HandlerOutcome};
use geoflow_shared::registry::{HandlerRegistry, JobRegistry};
use geoflow_shared::workflow::{
    FieldSpec, ParameterSchema, StageDefinition, TaskSpec, WorkflowDefinition,
};
use geoflow_shared::SystemContext;
use geoflow_worker::TaskQueueProcessor;

#[derive(Debug, Parser)]
#[command(name = "geoflow-demo", about = "Run a demo job through the geoflow core")]
struct Args {
    /// Number of parallel chunks in the middle stage
    #[arg(long, default_value_t = 3)]
    chunk_count: i64,

    /// Rows per chunk reported by the extract stage
    #[arg(long, default_value_t = 100)]
    rows_per_chunk: i64,
}

fn demo_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "process_csv",
        vec![
            StageDefinition::new(1, "extract", "extract"),
            StageDefinition::new(2, "validate", "validate")
                .dynamic()
                .with_lineage(),
            StageDefinition::new(3, "load", "load").with_lineage(),
        ],
        ParameterSchema::new()
            .field(
                FieldSpec::integer("chunk_count")
                    .with_default(json!(3))
                    .bounded(Some(1.0), Some(64.0)),
            )
            .field(
                FieldSpec::integer("rows_per_chunk")
                    .with_default(json!(100))
                    .bounded(Some(1.0), None),
            ),
        Arc::new(|ctx| match ctx.stage.number {
            1 => Ok(vec![TaskSpec::new("0", ctx.parameters.clone())]),
            2 => {
                let chunks = ctx.parameters["chunk_count"].as_i64().unwrap_or(1);
                let rows = ctx.parameters["rows_per_chunk"].as_i64().unwrap_or(0);
                Ok((0..chunks)
                    .map(|i| TaskSpec::new(format!("chunk_{i}"), json!({"chunk": i, "rows": rows})))
                    .collect())
            }
            3 => {
                let validated: i64 = ctx
                    .previous_results
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|r| r.result.as_ref())
                    .filter_map(|v| v["valid_rows"].as_i64())
                    .sum();
                Ok(vec![TaskSpec::new("0", json!({"rows": validated}))])
            }
            other => Err(format!("unexpected stage {other}")),
        }),
    )
    .with_aggregator(Arc::new(|job| {
        let last = job.total_stages.to_string();
        let uploaded = job
            .stage_results
            .get(&last)
            .and_then(|results| results.first())
            .and_then(|r| r.result.as_ref())
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(json!({"upload": uploaded}))
    }))
}

fn demo_handlers() -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "extract",
        sync_handler(|params| {
            let chunks = params["chunk_count"].as_i64().unwrap_or(0);
            let rows = params["rows_per_chunk"].as_i64().unwrap_or(0);
            HandlerOutcome::success(json!({"total_rows": chunks * rows}))
        }),
    )?;
    handlers.register(
        "validate",
        sync_handler(|params| {
            HandlerOutcome::success(json!({"valid_rows": params["rows"].as_i64().unwrap_or(0)}))
        }),
    )?;
    handlers.register(
        "load",
        sync_handler(|params| {
            HandlerOutcome::success(json!({"rows_uploaded": params["rows"].as_i64().unwrap_or(0)}))
        }),
    )?;
    Ok(handlers)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut jobs = JobRegistry::new();
    jobs.register(demo_workflow())?;
    let context = Arc::new(SystemContext::in_memory(
        GeoflowConfig::default(),
        jobs,
        demo_handlers()?,
    )?);
    context.queue().ensure_queues().await?;

    let submission = SubmissionService::new(context.clone());
    let receipt = submission
        .submit_job(
            "process_csv",
            &json!({"chunk_count": args.chunk_count, "rows_per_chunk": args.rows_per_chunk}),
        )
        .await?;
    info!(job_id = %receipt.job_id, "submitted demo job");

    // Pump both queues until the job settles.
    let job_loop = JobQueueProcessor::new(context.clone());
    let task_loop = TaskQueueProcessor::new(context.clone());
    loop {
        let moved = job_loop.process_batch().await? + task_loop.process_batch().await?;
        let view = submission
            .get_job_status(&receipt.job_id)
            .await?
            .context("submitted job vanished")?;
        if view.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&view)?);
            return Ok(());
        }
        if moved == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
