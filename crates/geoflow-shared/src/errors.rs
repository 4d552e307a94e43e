//! # Geoflow Error Types
//!
//! Unified error handling for the orchestration core. Component-local
//! errors (`StoreError`, `MessagingError`, `SubmissionError`) convert into
//! the top-level [`GeoflowError`] so library entry points expose a single
//! result type.

use thiserror::Error;

/// Core operation result type
pub type GeoflowResult<T> = Result<T, GeoflowError>;

/// Top-level error for orchestration and worker operations
#[derive(Debug, Error)]
pub enum GeoflowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("workflow error for job {job_id}: {reason}")]
    Workflow { job_id: String, reason: String },

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("registration error: {0}")]
    Registration(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GeoflowError {
    /// Create a workflow error for a specific job
    pub fn workflow(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Workflow {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    /// Check whether the error is transient (worth leaving the message
    /// leased so the queue redelivers it) or permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Messaging(e) => e.is_transient(),
            Self::Configuration(_)
            | Self::Workflow { .. }
            | Self::UnknownJobType(_)
            | Self::UnknownTaskType(_)
            | Self::Registration(_)
            | Self::Serialization(_) => false,
        }
    }
}

/// Errors raised by the state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

/// Errors raised by the messaging layer
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("queue backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Unavailable(_))
    }
}

/// Structured submission errors surfaced synchronously to callers
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid parameter '{field}': {reason}")]
    InvalidParameters { field: String, reason: String },

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl SubmissionError {
    /// Create an invalid-parameters error
    pub fn invalid_parameters(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for API collaborators
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownJobType(_) => "UNKNOWN_JOB_TYPE",
            Self::InvalidParameters { .. } => "INVALID_PARAMETERS",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
        }
    }

    /// Transient submission errors may be retried by the caller as-is
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::QueueUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_error_source() {
        assert!(GeoflowError::Store(StoreError::Unavailable("down".into())).is_transient());
        assert!(GeoflowError::Messaging(MessagingError::Unavailable("down".into())).is_transient());
        assert!(!GeoflowError::workflow("abc", "empty stage").is_transient());
        assert!(!GeoflowError::UnknownTaskType("noop".into()).is_transient());
    }

    #[test]
    fn submission_error_codes_are_stable() {
        assert_eq!(
            SubmissionError::UnknownJobType("x".into()).code(),
            "UNKNOWN_JOB_TYPE"
        );
        assert_eq!(
            SubmissionError::invalid_parameters("chunk_count", "must be positive").code(),
            "INVALID_PARAMETERS"
        );
        assert_eq!(
            SubmissionError::QueueUnavailable("timeout".into()).code(),
            "QUEUE_UNAVAILABLE"
        );
    }
}
