//! # QueueClient Domain Facade
//!
//! Domain-level messaging client: resolves queue names, serializes the
//! wire messages, and owns dead-letter handling. Wraps a
//! [`MessagingProvider`] behind an `Arc` so clones are cheap and the
//! client can be shared across message loops.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::errors::MessagingError;

use super::messages::QueueMessage;
use super::provider::MessagingProvider;
use super::types::{QueuedMessage, RawMessage, ReceiptHandle};

/// Resolved queue names for one deployment namespace
#[derive(Debug, Clone)]
pub struct QueueNames {
    pub jobs: String,
    pub tasks: String,
    pub dead_letter: String,
}

impl QueueNames {
    /// Compose queue names as `<namespace>_<queue>`.
    pub fn for_namespace(
        namespace: &str,
        jobs: &str,
        tasks: &str,
        dead_letter: &str,
    ) -> Self {
        Self {
            jobs: format!("{namespace}_{jobs}"),
            tasks: format!("{namespace}_{tasks}"),
            dead_letter: format!("{namespace}_{dead_letter}"),
        }
    }
}

/// Shared messaging client for the orchestration core
#[derive(Debug, Clone)]
pub struct QueueClient {
    provider: Arc<MessagingProvider>,
    names: QueueNames,
}

impl QueueClient {
    #[must_use]
    pub fn new(provider: Arc<MessagingProvider>, names: QueueNames) -> Self {
        Self { provider, names }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<MessagingProvider> {
        &self.provider
    }

    #[must_use]
    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    /// Create the job, task, and dead-letter queues. Idempotent; run at
    /// process start.
    pub async fn ensure_queues(&self) -> Result<(), MessagingError> {
        for queue in [&self.names.jobs, &self.names.tasks, &self.names.dead_letter] {
            self.provider.create_queue(queue).await?;
        }
        Ok(())
    }

    /// Enqueue a job message for `(job_id, stage)`.
    pub async fn enqueue_job(&self, job_id: &str, stage: i32) -> Result<i64, MessagingError> {
        let body = serde_json::to_value(QueueMessage::job(job_id, stage))?;
        self.provider.send(&self.names.jobs, &body).await
    }

    /// Enqueue a task message.
    pub async fn enqueue_task(&self, task_id: &str) -> Result<i64, MessagingError> {
        let body = serde_json::to_value(QueueMessage::task(task_id))?;
        self.provider.send(&self.names.tasks, &body).await
    }

    /// Receive job messages with a per-message lease.
    pub async fn receive_jobs(
        &self,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, MessagingError> {
        self.receive_from(&self.names.jobs, visibility_timeout, limit)
            .await
    }

    /// Receive task messages with a per-message lease.
    pub async fn receive_tasks(
        &self,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, MessagingError> {
        self.receive_from(&self.names.tasks, visibility_timeout, limit)
            .await
    }

    async fn receive_from(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, MessagingError> {
        let raw = self.provider.read(queue, visibility_timeout, limit).await?;

        let mut decoded = Vec::with_capacity(raw.len());
        for message in raw {
            match serde_json::from_value::<QueueMessage>(message.body.clone()) {
                Ok(payload) => decoded.push(QueuedMessage {
                    payload,
                    receipt: message.receipt,
                    delivery_count: message.delivery_count,
                }),
                Err(e) => {
                    // Undecodable payloads can never succeed; quarantine
                    // them instead of redelivering forever.
                    warn!(
                        queue = queue,
                        message_id = message.receipt.message_id,
                        error = %e,
                        "dead-lettering undecodable message"
                    );
                    self.dead_letter_raw(&message, "undecodable payload").await?;
                }
            }
        }
        Ok(decoded)
    }

    /// Acknowledge a message after its effects are persisted.
    pub async fn ack(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        self.provider.delete(receipt).await
    }

    /// Return a message to its queue for immediate redelivery.
    pub async fn release(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        self.provider.release(receipt).await
    }

    /// Move a message to the dead-letter queue with a reason envelope.
    pub async fn dead_letter(
        &self,
        receipt: &ReceiptHandle,
        body: Value,
        reason: &str,
    ) -> Result<(), MessagingError> {
        let envelope = json!({
            "reason": reason,
            "source_queue": receipt.queue,
            "message": body,
        });
        self.provider.send(&self.names.dead_letter, &envelope).await?;
        self.provider.delete(receipt).await
    }

    async fn dead_letter_raw(
        &self,
        message: &RawMessage,
        reason: &str,
    ) -> Result<(), MessagingError> {
        self.dead_letter(&message.receipt, message.body.clone(), reason)
            .await
    }
}
