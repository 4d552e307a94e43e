//! Shared fixtures for orchestration integration tests: a context over
//! in-memory infrastructure plus a few small workflows.

use std::sync::Arc;

use serde_json::{json, Value};

use geoflow_shared::config::GeoflowConfig;
use geoflow_shared::handler::{sync_handler, HandlerOutcome};
use geoflow_shared::registry::{HandlerRegistry, JobRegistry};
use geoflow_shared::workflow::{
    FieldSpec, ParameterSchema, StageDefinition, TaskSpec, WorkflowDefinition,
};
use geoflow_shared::SystemContext;

/// Config tuned for tests: reconciler lease of zero so sweeps see
/// everything immediately.
pub fn test_config() -> GeoflowConfig {
    let mut config = GeoflowConfig::default();
    config.reconciler.lease_seconds = 0;
    config.reconciler.max_retries = 2;
    config
}

/// One stage, one task.
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
}

/// Stage 1 fans out `width` tasks; stage 2 is a single merge task fed by
/// lineage. `tolerant` switches stage 1's failure policy.
pub fn two_stage_workflow(job_type: &str, width: i64, tolerant: bool) -> WorkflowDefinition {
    let stage_one = StageDefinition::new(1, "scatter", "chunk").dynamic();
    let stage_one = if tolerant { stage_one.tolerant() } else { stage_one };

    WorkflowDefinition::new(
        job_type,
        vec![
            stage_one,
            StageDefinition::new(2, "gather", "merge").with_lineage(),
        ],
        ParameterSchema::new(),
        Arc::new(move |ctx| match ctx.stage.number {
            1 => Ok((0..width)
                .map(|i| TaskSpec::new(i.to_string(), json!({"chunk": i})))
                .collect()),
            2 => {
                let upstream = ctx.previous_results.map_or(0, <[_]>::len);
                Ok(vec![TaskSpec::new("0", json!({"inputs": upstream}))])
            }
            other => Err(format!("unexpected stage {other}")),
        }),
    )
}

/// Workflow whose builder produces an empty stage.
pub fn empty_fanout_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "empty_fanout",
        vec![StageDefinition::new(1, "nothing", "chunk")],
        ParameterSchema::new(),
        Arc::new(|_| Ok(vec![])),
    )
}

/// Handler registry covering every task type the test workflows use.
/// Orchestration tests never execute handlers; registration exists so
/// registry validation passes.
pub fn test_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for task_type in ["greet", "chunk", "merge"] {
        handlers
            .register(task_type, sync_handler(|_| HandlerOutcome::success(Value::Null)))
            .expect("register test handler");
    }
    handlers
}

/// Context over in-memory infrastructure with the given workflows.
pub async fn test_context(workflows: Vec<WorkflowDefinition>) -> Arc<SystemContext> {
    let mut jobs = JobRegistry::new();
    for workflow in workflows {
        jobs.register(workflow).expect("register test workflow");
    }
    let context = SystemContext::in_memory(test_config(), jobs, test_handlers())
        .expect("build test context");
    context
        .queue()
        .ensure_queues()
        .await
        .expect("create test queues");
    Arc::new(context)
}
