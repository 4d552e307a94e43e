//! # Configuration
//!
//! Typed configuration for the orchestration core, loaded by layering an
//! optional TOML file under `GEOFLOW_`-prefixed environment variables
//! (`GEOFLOW_DATABASE__URL` overrides `database.url`, and so on). Every
//! section has working defaults so a development process starts with no
//! configuration at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{GeoflowError, GeoflowResult};
use crate::messaging::QueueNames;

/// Default configuration file consulted when none is given explicitly
const DEFAULT_CONFIG_PATH: &str = "config/geoflow";

/// Top-level configuration for orchestration and worker processes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoflowConfig {
    pub database: DatabaseConfig,
    pub queues: QueueConfig,
    pub executor: ExecutorConfig,
    pub reconciler: ReconcilerConfig,
}

impl GeoflowConfig {
    /// Load from the default file location plus environment overrides.
    pub fn load() -> GeoflowResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file (extension inferred) plus environment
    /// overrides.
    pub fn load_from(path: &str) -> GeoflowResult<Self> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("GEOFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| GeoflowError::Configuration(e.to_string()))
    }
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/geoflow".to_string(),
            pool_size: 10,
        }
    }
}

/// Queue naming and consumption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix shared by every queue of this deployment
    pub namespace: String,
    pub job_queue: String,
    pub task_queue: String,
    pub dead_letter_queue: String,
    /// Per-message lease while a consumer works on it
    pub visibility_timeout_seconds: u64,
    /// Idle sleep between empty polls
    pub poll_interval_ms: u64,
    /// Messages read per poll
    pub batch_size: usize,
    /// Deliveries after which a message is poison
    pub max_delivery_attempts: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "geoflow".to_string(),
            job_queue: "jobs".to_string(),
            task_queue: "tasks".to_string(),
            dead_letter_queue: "dead_letter".to_string(),
            visibility_timeout_seconds: 30,
            poll_interval_ms: 250,
            batch_size: 10,
            max_delivery_attempts: 5,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn queue_names(&self) -> QueueNames {
        QueueNames::for_namespace(
            &self.namespace,
            &self.job_queue,
            &self.task_queue,
            &self.dead_letter_queue,
        )
    }

    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Task execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Fallback per-task handler timeout when a workflow does not set
    /// its own (seconds)
    pub handler_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            handler_timeout_seconds: 30 * 60,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }
}

/// Background reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Sweep period (seconds)
    pub interval_seconds: u64,
    /// Age after which a PROCESSING task or stalled job is reclaimed
    /// (seconds)
    pub lease_seconds: u64,
    /// Reclaims after which a task is failed instead of requeued
    pub max_retries: i32,
    /// Rows examined per sweep per query
    pub sweep_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            lease_seconds: 300,
            max_retries: 3,
            sweep_limit: 100,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}
