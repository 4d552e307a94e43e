//! # System Context
//!
//! One struct holding everything a message processor needs: config,
//! state store, queue client, and the two registries. Built once at
//! process init and passed explicitly; registries are frozen before the
//! context is constructed, so reads need no locks.

use std::sync::Arc;

use crate::config::GeoflowConfig;
use crate::errors::GeoflowResult;
use crate::messaging::{MessagingProvider, QueueClient};
use crate::registry::{HandlerRegistry, JobRegistry};
use crate::store::StateStore;

/// Shared dependencies of the orchestrator, executor, and reconciler
#[derive(Debug, Clone)]
pub struct SystemContext {
    config: Arc<GeoflowConfig>,
    store: StateStore,
    queue: QueueClient,
    job_registry: Arc<JobRegistry>,
    handler_registry: Arc<HandlerRegistry>,
}

impl SystemContext {
    /// Assemble a context, validating the registries against each other
    /// so misconfigured workflows fail at startup.
    pub fn new(
        config: Arc<GeoflowConfig>,
        store: StateStore,
        queue: QueueClient,
        job_registry: Arc<JobRegistry>,
        handler_registry: Arc<HandlerRegistry>,
    ) -> GeoflowResult<Self> {
        job_registry.validate_all(&handler_registry)?;
        Ok(Self {
            config,
            store,
            queue,
            job_registry,
            handler_registry,
        })
    }

    /// Context backed entirely by in-memory infrastructure. The caller
    /// still owns queue creation (`queue().ensure_queues()`).
    pub fn in_memory(
        config: GeoflowConfig,
        job_registry: JobRegistry,
        handler_registry: HandlerRegistry,
    ) -> GeoflowResult<Self> {
        let queue = QueueClient::new(
            Arc::new(MessagingProvider::in_memory()),
            config.queues.queue_names(),
        );
        Self::new(
            Arc::new(config),
            StateStore::in_memory(),
            queue,
            Arc::new(job_registry),
            Arc::new(handler_registry),
        )
    }

    #[must_use]
    pub fn config(&self) -> &GeoflowConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    #[must_use]
    pub fn job_registry(&self) -> &JobRegistry {
        &self.job_registry
    }

    #[must_use]
    pub fn handler_registry(&self) -> &HandlerRegistry {
        &self.handler_registry
    }
}
