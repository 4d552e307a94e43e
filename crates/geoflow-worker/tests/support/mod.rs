//! Shared fixtures for worker integration tests: real workflows with
//! real handlers over in-memory infrastructure, plus a pump that drains
//! both queues the way deployed processors would.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use geoflow_orchestration::JobQueueProcessor;
use geoflow_shared::config::GeoflowConfig;
use geoflow_shared::handler::{sync_handler, HandlerOutcome, TaskHandler};
use geoflow_shared::registry::{HandlerRegistry, JobRegistry};
use geoflow_shared::workflow::{
    FieldSpec, ParameterSchema, StageDefinition, TaskSpec, WorkflowDefinition,
};
use geoflow_shared::SystemContext;
use geoflow_worker::TaskQueueProcessor;

/// Config tuned for tests: immediate reconciler visibility and a low
/// poison threshold.
pub fn test_config() -> GeoflowConfig {
    let mut config = GeoflowConfig::default();
    config.reconciler.lease_seconds = 0;
    config.reconciler.max_retries = 2;
    config.queues.max_delivery_attempts = 3;
    config
}

/// Handler that greets by name.
pub fn greet_handler() -> Arc<dyn TaskHandler> {
    sync_handler(|params| {
        let name = params["name"].as_str().unwrap_or("world").to_string();
        HandlerOutcome::success(json!({"greeting": format!("hi {name}")}))
    })
}

/// Handler that counts invocations before succeeding.
pub fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn TaskHandler> {
    sync_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::success(json!({"ok": true}))
    })
}

/// Handler that sleeps asynchronously; used for timeout coverage.
struct SleepHandler {
    duration: Duration,
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn call(&self, _parameters: Value) -> HandlerOutcome {
        tokio::time::sleep(self.duration).await;
        HandlerOutcome::success(json!({"slept_ms": self.duration.as_millis() as u64}))
    }
}

pub fn sleep_handler(duration: Duration) -> Arc<dyn TaskHandler> {
    Arc::new(SleepHandler { duration })
}

/// Single-stage workflow `hello` with an aggregator that lifts the lone
/// task's result into `result_data`.
pub fn hello_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "hello",
        vec![StageDefinition::new(1, "greet", "greet")],
        ParameterSchema::new().field(FieldSpec::string("name").required()),
        Arc::new(|ctx| {
            Ok(vec![TaskSpec::new(
                "0",
                json!({"name": ctx.parameters["name"]}),
            )])
        }),
    )
    .with_aggregator(Arc::new(|job| {
        job.stage_results
            .get("1")
            .and_then(|results| results.first())
            .and_then(|entry| entry.result.clone())
            .ok_or_else(|| "hello produced no result".to_string())
    }))
}

/// Three-stage fan-out/fan-in workflow `process_csv`:
/// extract (single) → validate (dynamic, lineage) → load (single,
/// lineage). Chunks whose index appears in `fail_chunks` report failure
/// in stage 2; `tolerant` switches stage 2's failure policy.
pub fn process_csv_workflow(tolerant: bool) -> WorkflowDefinition {
    let validate = StageDefinition::new(2, "validate", "validate")
        .dynamic()
        .with_lineage();
    let validate = if tolerant { validate.tolerant() } else { validate };

    WorkflowDefinition::new(
        "process_csv",
        vec![
            StageDefinition::new(1, "extract", "extract"),
            validate,
            StageDefinition::new(3, "load", "load").with_lineage(),
        ],
        ParameterSchema::new()
            .field(
                FieldSpec::integer("chunk_count")
                    .with_default(json!(3))
                    .bounded(Some(1.0), Some(64.0)),
            )
            .field(FieldSpec::object("fail_chunks").with_default(json!({}))),
        Arc::new(|ctx| match ctx.stage.number {
            1 => Ok(vec![TaskSpec::new("0", ctx.parameters.clone())]),
            2 => {
                let chunks = ctx.parameters["chunk_count"].as_i64().unwrap_or(1);
                let total_rows: i64 = ctx
                    .previous_results
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|r| r.result.as_ref())
                    .filter_map(|v| v["total_rows"].as_i64())
                    .sum();
                let per_chunk = total_rows / chunks.max(1);
                let fail_chunks = ctx.parameters["fail_chunks"].clone();
                Ok((0..chunks)
                    .map(|i| {
                        TaskSpec::new(
                            format!("chunk_{i}"),
                            json!({
                                "chunk": i,
                                "rows": per_chunk,
                                "fail": fail_chunks[i.to_string()] == json!(true),
                            }),
                        )
                    })
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
        job.stage_results
            .get(&job.total_stages.to_string())
            .and_then(|results| results.first())
            .and_then(|entry| entry.result.clone())
            .ok_or_else(|| "load stage produced no result".to_string())
    }))
}

/// Handlers backing `process_csv`.
pub fn csv_handlers(handlers: &mut HandlerRegistry) -> Result<()> {
    handlers.register(
        "extract",
        sync_handler(|params| {
            let chunks = params["chunk_count"].as_i64().unwrap_or(0);
            HandlerOutcome::success(json!({
                "total_rows": chunks * 100,
                "temp_path": "/t/f",
            }))
        }),
    )?;
    handlers.register(
        "validate",
        sync_handler(|params| {
            if params["fail"] == json!(true) {
                HandlerOutcome::failure("bad row", "ValidationError")
            } else {
                HandlerOutcome::success(json!({"valid_rows": params["rows"].as_i64().unwrap_or(0)}))
            }
        }),
    )?;
    handlers.register(
        "load",
        sync_handler(|params| {
            HandlerOutcome::success(json!({"rows_uploaded": params["rows"].as_i64().unwrap_or(0)}))
        }),
    )?;
    Ok(())
}

/// Context over in-memory infrastructure.
pub async fn test_context(
    workflows: Vec<WorkflowDefinition>,
    handlers: HandlerRegistry,
) -> Result<Arc<SystemContext>> {
    let mut jobs = JobRegistry::new();
    for workflow in workflows {
        jobs.register(workflow)?;
    }
    let context = Arc::new(SystemContext::in_memory(test_config(), jobs, handlers)?);
    context.queue().ensure_queues().await?;
    Ok(context)
}

/// Drain both queues through the real processors until neither settles
/// another message. Panics if the system fails to quiesce.
pub async fn pump(context: &Arc<SystemContext>) -> Result<()> {
    let job_loop = JobQueueProcessor::new(context.clone());
    let task_loop = TaskQueueProcessor::new(context.clone());

    let mut idle_rounds = 0;
    for _ in 0..200 {
        let settled = job_loop.process_batch().await? + task_loop.process_batch().await?;
        if settled == 0 {
            idle_rounds += 1;
            if idle_rounds >= 2 {
                return Ok(());
            }
        } else {
            idle_rounds = 0;
        }
    }
    anyhow::bail!("queues failed to drain in 200 rounds")
}
