//! # Job Queue Processor
//!
//! The message loop feeding the [`CoreMachine`]: batch-reads job
//! messages under a visibility lease, dispatches on the message kind,
//! and acknowledges only after the orchestrator has persisted its
//! effects. Transient failures leave the message leased so the queue
//! redelivers it; poison messages are quarantined on the dead-letter
//! queue.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use geoflow_shared::messaging::{QueueMessage, QueuedMessage};
use geoflow_shared::{GeoflowResult, SystemContext};

use super::core_machine::CoreMachine;

/// Polls the job queue and drives the orchestrator
#[derive(Debug, Clone)]
pub struct JobQueueProcessor {
    context: Arc<SystemContext>,
    core: CoreMachine,
    processor_id: Uuid,
}

impl JobQueueProcessor {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        let core = CoreMachine::new(context.clone());
        Self {
            context,
            core,
            processor_id: Uuid::new_v4(),
        }
    }

    /// Run the polling loop forever.
    pub async fn run(&self) -> GeoflowResult<()> {
        info!(processor_id = %self.processor_id, "job queue processor started");
        loop {
            match self.process_batch().await {
                Ok(0) => self.idle_sleep().await,
                Ok(handled) => debug!(handled, "processed job message batch"),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "transient failure in job loop; backing off");
                    self.idle_sleep().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep the poll interval with a little jitter so idle processors
    /// do not stampede the queue in lockstep.
    async fn idle_sleep(&self) {
        let base = self.context.config().queues.poll_interval();
        let jitter = base.mul_f64(fastrand::f64() * 0.2);
        tokio::time::sleep(base + jitter).await;
    }

    /// Read and handle one batch. Returns how many messages were
    /// processed to completion (acknowledged or dead-lettered).
    #[instrument(skip(self), fields(processor_id = %self.processor_id))]
    pub async fn process_batch(&self) -> GeoflowResult<usize> {
        let queues = &self.context.config().queues;
        let messages = self
            .context
            .queue()
            .receive_jobs(queues.visibility_timeout(), queues.batch_size)
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

    /// Handle one delivery. Returns whether the message was settled
    /// (acked or dead-lettered) as opposed to left leased for retry.
    async fn handle_message(&self, message: &QueuedMessage) -> GeoflowResult<bool> {
        let queue = self.context.queue();
        let max_attempts = self.context.config().queues.max_delivery_attempts;

        if message.delivery_count > max_attempts {
            warn!(
                message_id = message.receipt.message_id,
                delivery_count = message.delivery_count,
                "job message exceeded delivery attempts; dead-lettering"
            );
            let body = serde_json::to_value(&message.payload)?;
            queue
                .dead_letter(&message.receipt, body, "delivery attempts exhausted")
                .await?;
            return Ok(true);
        }

        let QueueMessage::Job { job_id, stage } = &message.payload else {
            // Task messages belong on the task queue; a misrouted one
            // can never be handled here.
            warn!(
                message_id = message.receipt.message_id,
                "task message on the job queue; dead-lettering"
            );
            let body = serde_json::to_value(&message.payload)?;
            queue
                .dead_letter(&message.receipt, body, "misrouted message kind")
                .await?;
            return Ok(true);
        };

        match self.core.handle_job_message(job_id, *stage).await {
            Ok(outcome) => {
                debug!(?outcome, "job message handled");
                queue.ack(&message.receipt).await?;
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                // Leave the message leased; it will redeliver after the
                // visibility timeout.
                warn!(error = %e, job_id = %job_id, "transient failure; message left for redelivery");
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, job_id = %job_id, "permanent failure handling job message");
                Err(e)
            }
        }
    }
}
