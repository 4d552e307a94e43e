//! # Task Handler Contract
//!
//! Handlers implement a task's behavior and report their outcome as an
//! explicit value, never by panicking: [`HandlerOutcome`] is a tagged
//! variant over success and failure. The executor converts escaped panics
//! and timeouts into failures at the boundary, so orchestration code only
//! ever sees the value form.
//!
//! Handlers must tolerate re-execution for the same task id: the
//! executor's compare-and-set usually prevents duplicate runs, but
//! at-least-once delivery makes re-invocation possible after a lease
//! expires.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Well-known `error_type` labels used across the core
pub mod error_types {
    pub const WORKFLOW_ERROR: &str = "WorkflowError";
    pub const CONTRACT_VIOLATION: &str = "ContractViolation";
    pub const MAX_RETRIES_EXCEEDED: &str = "MaxRetriesExceeded";
    pub const TIMEOUT: &str = "Timeout";
    pub const HANDLER_PANIC: &str = "HandlerPanic";
    pub const UNKNOWN_TASK_TYPE: &str = "UnknownTaskType";
}

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success {
        result: Value,
    },
    Failure {
        error: String,
        error_type: Option<String>,
    },
}

impl HandlerOutcome {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn failure(error: impl Into<String>, error_type: &str) -> Self {
        Self::Failure {
            error: error.into(),
            error_type: Some(error_type.to_string()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Interpret a loose JSON value against the handler result contract:
    /// an object with a boolean `success` field, a `result` payload on
    /// success, and a human-readable `error` (plus optional `error_type`)
    /// on failure.
    ///
    /// A missing or non-boolean `success` is a contract bug in the
    /// handler, normalized to a failure with `error_type=ContractViolation`
    /// so the task still reaches a terminal state.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let Some(success) = value.get("success").and_then(Value::as_bool) else {
            tracing::error!(
                payload = %value,
                "handler violated the result contract: missing or non-boolean 'success'"
            );
            return Self::failure(
                "handler result missing boolean 'success' field",
                error_types::CONTRACT_VIOLATION,
            );
        };

        if success {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            return Self::Success { result };
        }

        let error = match value.get("error").and_then(Value::as_str) {
            Some(e) => e.to_string(),
            None => {
                tracing::error!(
                    payload = %value,
                    "handler violated the result contract: failure without 'error' string"
                );
                return Self::failure(
                    "handler reported failure without an 'error' string",
                    error_types::CONTRACT_VIOLATION,
                );
            }
        };
        let error_type = value
            .get("error_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::Failure { error, error_type }
    }
}

/// A registered task handler
///
/// Implementations receive the task's validated parameters and return an
/// outcome value. Infrastructure errors belong in the failure variant;
/// the executor treats anything that escapes as a handler defect.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, parameters: Value) -> HandlerOutcome;
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TaskHandler")
    }
}

/// Adapter turning a synchronous closure into a [`TaskHandler`].
///
/// Most computational handlers are plain functions of their parameters;
/// this keeps their registration terse.
struct SyncHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for SyncHandler<F>
where
    F: Fn(Value) -> HandlerOutcome + Send + Sync,
{
    async fn call(&self, parameters: Value) -> HandlerOutcome {
        (self.0)(parameters)
    }
}

/// Wrap a synchronous closure as a shareable handler.
pub fn sync_handler<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Value) -> HandlerOutcome + Send + Sync + 'static,
{
    Arc::new(SyncHandler(f))
}
