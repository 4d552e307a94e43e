//! # In-Memory Provider
//!
//! A process-local queue with the same lease semantics as PGMQ: reads
//! hide a message for the visibility timeout and bump its delivery
//! count; unacknowledged messages reappear when the lease expires. Used
//! by the test harness so the full orchestration loop runs without
//! PostgreSQL; semantics mirror the durable provider exactly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::MessagingError;

use super::types::{RawMessage, ReceiptHandle};

#[derive(Debug)]
struct StoredMessage {
    id: i64,
    body: Value,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, Vec<StoredMessage>>,
    next_id: i64,
}

/// In-memory queue provider with PGMQ-equivalent lease semantics
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("queue state mutex poisoned")
    }

    pub fn create_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    pub fn send(&self, queue: &str, body: &Value) -> Result<i64, MessagingError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::UnknownQueue(queue.to_string()))?;
        messages.push(StoredMessage {
            id,
            body: body.clone(),
            read_count: 0,
            enqueued_at: now,
            visible_at: now,
        });
        Ok(id)
    }

    pub fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<RawMessage>, MessagingError> {
        let mut state = self.lock();
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::UnknownQueue(queue.to_string()))?;

        let now = Utc::now();
        let lease = chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut delivered = Vec::new();
        for message in messages.iter_mut() {
            if delivered.len() >= limit {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.visible_at = now + lease;
            message.read_count += 1;
            delivered.push(RawMessage {
                receipt: ReceiptHandle::new(queue, message.id),
                delivery_count: message.read_count,
                enqueued_at: message.enqueued_at,
                body: message.body.clone(),
            });
        }
        Ok(delivered)
    }

    pub fn delete(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        let mut state = self.lock();
        if let Some(messages) = state.queues.get_mut(&receipt.queue) {
            messages.retain(|m| m.id != receipt.message_id);
        }
        Ok(())
    }

    pub fn release(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        let mut state = self.lock();
        if let Some(messages) = state.queues.get_mut(&receipt.queue) {
            if let Some(message) = messages.iter_mut().find(|m| m.id == receipt.message_id) {
                message.visible_at = Utc::now();
            }
        }
        Ok(())
    }

    /// Number of messages currently stored (visible or leased).
    #[must_use]
    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, Vec::len)
    }
}
