//! # Workflow Definitions
//!
//! A workflow is an ordered sequence of stages executed strictly in
//! order; all tasks within a stage run in parallel. Task creation is a
//! pure function of the stage, the job parameters, and (for lineage
//! stages) the previous stage's recorded results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::models::{JobRecord, StageTaskResult};

use super::schema::ParameterSchema;

/// Default per-task handler timeout: 30 minutes
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How a stage's task count is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Exactly one task
    Single,
    /// Task count decided by the builder, typically from job parameters
    /// or lineage
    Dynamic,
}

/// What a failed task does to the job once the stage closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any failed task fails the job at stage closure
    FailFast,
    /// The job continues; failures surface as COMPLETED_WITH_ERRORS
    Tolerant,
}

/// One sequential step within a workflow
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// 1-based position
    pub number: i32,
    /// Human label
    pub name: String,
    /// Handler key used for tasks in this stage
    pub task_type: String,
    pub parallelism: Parallelism,
    pub failure_policy: FailurePolicy,
    /// Whether the builder must receive the previous stage's results
    pub uses_lineage: bool,
}

impl StageDefinition {
    pub fn new(number: i32, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            task_type: task_type.into(),
            parallelism: Parallelism::Single,
            failure_policy: FailurePolicy::FailFast,
            uses_lineage: false,
        }
    }

    #[must_use]
    pub fn dynamic(mut self) -> Self {
        self.parallelism = Parallelism::Dynamic;
        self
    }

    #[must_use]
    pub fn tolerant(mut self) -> Self {
        self.failure_policy = FailurePolicy::Tolerant;
        self
    }

    #[must_use]
    pub fn with_lineage(mut self) -> Self {
        self.uses_lineage = true;
        self
    }
}

/// Inputs handed to a task builder for one stage of one job
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub stage: &'a StageDefinition,
    pub job_id: &'a str,
    /// The job's validated parameters
    pub parameters: &'a Value,
    /// Ordered results of the previous stage, present when `stage > 1`
    pub previous_results: Option<&'a [StageTaskResult]>,
}

/// A task to create, produced by a builder
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    /// Unique within `(job_id, stage)`; becomes the task-id suffix
    pub semantic_index: String,
    pub parameters: Value,
}

impl TaskSpec {
    pub fn new(semantic_index: impl Into<String>, parameters: Value) -> Self {
        Self {
            semantic_index: semantic_index.into(),
            parameters,
        }
    }
}

/// Pure function producing the tasks for a stage
pub type TaskBuilder =
    Arc<dyn Fn(&StageContext<'_>) -> Result<Vec<TaskSpec>, String> + Send + Sync>;

/// Optional terminal aggregation over a job's accumulated stage results
pub type ResultAggregator = Arc<dyn Fn(&JobRecord) -> Result<Value, String> + Send + Sync>;

/// Declarative description of a job type
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub job_type: String,
    pub stages: Vec<StageDefinition>,
    pub parameters_schema: ParameterSchema,
    /// Per-task handler timeout for this workflow
    pub task_timeout: Duration,
    build_tasks: TaskBuilder,
    aggregate: Option<ResultAggregator>,
}

impl WorkflowDefinition {
    pub fn new(
        job_type: impl Into<String>,
        stages: Vec<StageDefinition>,
        parameters_schema: ParameterSchema,
        build_tasks: TaskBuilder,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            stages,
            parameters_schema,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            build_tasks,
            aggregate: None,
        }
    }

    #[must_use]
    pub fn with_aggregator(mut self, aggregate: ResultAggregator) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    #[must_use]
    pub fn total_stages(&self) -> i32 {
        self.stages.len() as i32
    }

    /// Look up a stage by its 1-based number.
    #[must_use]
    pub fn stage(&self, number: i32) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.number == number)
    }

    /// Invoke the task builder for one stage, enforcing the builder
    /// contract: lineage stages receive previous results, the set is
    /// non-empty, and semantic indices are unique within the stage.
    pub fn build_tasks_for_stage(
        &self,
        context: &StageContext<'_>,
    ) -> Result<Vec<TaskSpec>, String> {
        if context.stage.uses_lineage && context.previous_results.is_none() {
            return Err(format!(
                "stage {} requires previous-stage results but none were supplied",
                context.stage.number
            ));
        }

        let specs = (self.build_tasks)(context)?;

        if specs.is_empty() {
            return Err(format!(
                "stage {} produced no tasks",
                context.stage.number
            ));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i]
                .iter()
                .any(|s| s.semantic_index == spec.semantic_index)
            {
                return Err(format!(
                    "stage {} produced duplicate semantic index '{}'",
                    context.stage.number, spec.semantic_index
                ));
            }
        }
        Ok(specs)
    }

    /// Terminal aggregation: the registered aggregator if present,
    /// otherwise the caller falls back to the final stage's results.
    pub fn aggregate_results(&self, job: &JobRecord) -> Option<Result<Value, String>> {
        self.aggregate.as_ref().map(|f| f(job))
    }

    /// Startup check: stage numbers are 1..N with no gaps and the
    /// parameter schema is well-formed. Handler resolution is checked by
    /// the job registry, which owns the handler table.
    pub fn ensure_well_formed(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err(format!("workflow {} declares no stages", self.job_type));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            let expected = (i + 1) as i32;
            if stage.number != expected {
                return Err(format!(
                    "workflow {}: stage at position {} is numbered {} (stages must be 1..N)",
                    self.job_type, expected, stage.number
                ));
            }
        }
        self.parameters_schema
            .ensure_well_formed()
            .map_err(|e| format!("workflow {}: {e}", self.job_type))
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("job_type", &self.job_type)
            .field("stages", &self.stages)
            .field("task_timeout", &self.task_timeout)
            .field("has_aggregator", &self.aggregate.is_some())
            .finish()
    }
}
