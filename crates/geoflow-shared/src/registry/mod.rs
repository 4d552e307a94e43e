//! # Handler and Job Registries
//!
//! Name-to-implementation maps populated during process startup and
//! frozen before any message is consumed. `validate_all` runs at startup
//! so a dangling task type or malformed workflow fails the process fast
//! instead of failing the first job that hits it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{GeoflowError, GeoflowResult};
use crate::handler::TaskHandler;
use crate::workflow::WorkflowDefinition;

/// Maps `task_type` strings to task handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a unique name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> GeoflowResult<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(GeoflowError::Registration(format!(
                "task type '{name}' is already registered"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> GeoflowResult<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| GeoflowError::UnknownTaskType(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    #[must_use]
    pub fn task_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// Maps `job_type` strings to workflow definitions
#[derive(Debug, Default)]
pub struct JobRegistry {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its job type.
    pub fn register(&mut self, workflow: WorkflowDefinition) -> GeoflowResult<()> {
        let job_type = workflow.job_type.clone();
        if self.workflows.contains_key(&job_type) {
            return Err(GeoflowError::Registration(format!(
                "job type '{job_type}' is already registered"
            )));
        }
        self.workflows.insert(job_type, Arc::new(workflow));
        Ok(())
    }

    pub fn lookup(&self, job_type: &str) -> GeoflowResult<Arc<WorkflowDefinition>> {
        self.workflows
            .get(job_type)
            .cloned()
            .ok_or_else(|| GeoflowError::UnknownJobType(job_type.to_string()))
    }

    #[must_use]
    pub fn contains(&self, job_type: &str) -> bool {
        self.workflows.contains_key(job_type)
    }

    #[must_use]
    pub fn job_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Startup validation over every registered workflow: contiguous
    /// stage numbering, well-formed parameter schema, and every stage's
    /// task type resolvable in the handler registry.
    pub fn validate_all(&self, handlers: &HandlerRegistry) -> GeoflowResult<()> {
        for workflow in self.workflows.values() {
            workflow
                .ensure_well_formed()
                .map_err(GeoflowError::Registration)?;
            for stage in &workflow.stages {
                if !handlers.contains(&stage.task_type) {
                    return Err(GeoflowError::Registration(format!(
                        "workflow {} stage {} references unregistered task type '{}'",
                        workflow.job_type, stage.number, stage.task_type
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{sync_handler, HandlerOutcome};
    use crate::workflow::{ParameterSchema, StageDefinition, TaskSpec};
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn noop_handler() -> StdArc<dyn TaskHandler> {
        sync_handler(|_| HandlerOutcome::success(json!(null)))
    }

    fn workflow(job_type: &str, task_type: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(
            job_type,
            vec![StageDefinition::new(1, "only", task_type)],
            ParameterSchema::new(),
            StdArc::new(|_| Ok(vec![TaskSpec::new("0", json!({}))])),
        )
    }

    #[test]
    fn duplicate_handler_names_are_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("noop", noop_handler()).unwrap();
        assert!(registry.register("noop", noop_handler()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_of_missing_handler_fails() {
        let registry = HandlerRegistry::new();
        match registry.lookup("missing") {
            Err(GeoflowError::UnknownTaskType(name)) => assert_eq!(name, "missing"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validate_all_accepts_resolvable_workflows() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("noop", noop_handler()).unwrap();

        let mut jobs = JobRegistry::new();
        jobs.register(workflow("hello", "noop")).unwrap();

        assert!(jobs.validate_all(&handlers).is_ok());
    }

    #[test]
    fn validate_all_rejects_dangling_task_types() {
        let handlers = HandlerRegistry::new();
        let mut jobs = JobRegistry::new();
        jobs.register(workflow("hello", "missing")).unwrap();

        let err = jobs.validate_all(&handlers).unwrap_err();
        match err {
            GeoflowError::Registration(msg) => assert!(msg.contains("missing")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn duplicate_job_types_are_rejected() {
        let mut jobs = JobRegistry::new();
        jobs.register(workflow("hello", "noop")).unwrap();
        assert!(jobs.register(workflow("hello", "noop")).is_err());
    }
}
