//! # Task Queue Processor
//!
//! The worker-side message loop: batch-reads task messages under a
//! visibility lease, quarantines poison, dispatches to the
//! [`TaskExecutor`], and acknowledges only after the outcome is
//! persisted. A crash anywhere before the acknowledge leaves the message
//! leased; the queue redelivers it and the executor's compare-and-set
//! sorts out who actually runs.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use geoflow_shared::messaging::{QueueMessage, QueuedMessage};
use geoflow_shared::{GeoflowResult, SystemContext};

use super::executor::TaskExecutor;

/// Polls the task queue and drives the executor
#[derive(Debug, Clone)]
pub struct TaskQueueProcessor {
    context: Arc<SystemContext>,
    executor: TaskExecutor,
    processor_id: Uuid,
}

impl TaskQueueProcessor {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        let executor = TaskExecutor::new(context.clone());
        Self {
            context,
            executor,
            processor_id: Uuid::new_v4(),
        }
    }

    /// Run the polling loop forever.
    pub async fn run(&self) -> GeoflowResult<()> {
        info!(processor_id = %self.processor_id, "task queue processor started");
        loop {
            match self.process_batch().await {
                Ok(0) => self.idle_sleep().await,
                Ok(handled) => debug!(handled, "processed task message batch"),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "transient failure in task loop; backing off");
                    self.idle_sleep().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn idle_sleep(&self) {
        let base = self.context.config().queues.poll_interval();
        let jitter = base.mul_f64(fastrand::f64() * 0.2);
        tokio::time::sleep(base + jitter).await;
    }

    /// Read and handle one batch. Returns how many messages were
    /// settled (acknowledged or dead-lettered).
    #[instrument(skip(self), fields(processor_id = %self.processor_id))]
    pub async fn process_batch(&self) -> GeoflowResult<usize> {
        let queues = &self.context.config().queues;
        let messages = self
            .context
            .queue()
            .receive_tasks(queues.visibility_timeout(), queues.batch_size)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }

        let mut handled = 0;
        for message in messages {
            if self.handle_message(&message).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn handle_message(&self, message: &QueuedMessage) -> GeoflowResult<bool> {
        let queue = self.context.queue();
        let max_attempts = self.context.config().queues.max_delivery_attempts;

        let QueueMessage::Task { task_id } = &message.payload else {
            warn!(
                message_id = message.receipt.message_id,
                "job message on the task queue; dead-lettering"
            );
            let body = serde_json::to_value(&message.payload)?;
            queue
                .dead_letter(&message.receipt, body, "misrouted message kind")
                .await?;
            return Ok(true);
        };

        if message.delivery_count > max_attempts {
            warn!(
                task_id = %task_id,
                delivery_count = message.delivery_count,
                "task message exceeded delivery attempts; dead-lettering as poison"
            );
            self.executor.poison_task(task_id).await?;
            let body = serde_json::to_value(&message.payload)?;
            queue
                .dead_letter(&message.receipt, body, "delivery attempts exhausted")
                .await?;
            return Ok(true);
        }

        match self.executor.process_task(task_id).await {
            Ok(super::executor::ExecutionOutcome::Orphan) => {
                // No task record behind the message: structural
                // corruption, quarantine it.
                warn!(task_id = %task_id, "task message references no record; dead-lettering");
                let body = serde_json::to_value(&message.payload)?;
                queue
                    .dead_letter(&message.receipt, body, "task record missing")
                    .await?;
                Ok(true)
            }
            Ok(outcome) => {
                debug!(?outcome, "task message handled");
                queue.ack(&message.receipt).await?;
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, task_id = %task_id, "transient failure; message left for redelivery");
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, task_id = %task_id, "permanent failure handling task message");
                Err(e)
            }
        }
    }
}
