//! Declarative workflow model: stage definitions, parameter schemas, and
//! the task-builder functions that fan a stage out into tasks.
//!
//! Workflows are data. A [`WorkflowDefinition`] is a plain value holding
//! its stages, its parameter schema, and closures for task creation and
//! result aggregation; the orchestrator never subclasses anything.

pub mod definition;
pub mod schema;

pub use definition::{
    FailurePolicy, Parallelism, ResultAggregator, StageContext, StageDefinition, TaskBuilder,
    TaskSpec, WorkflowDefinition,
};
pub use schema::{FieldKind, FieldSpec, ParameterSchema};
