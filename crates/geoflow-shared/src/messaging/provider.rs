//! Provider enum over the concrete queue backends. Enum dispatch keeps
//! the call sites monomorphic and the whole messaging layer free of
//! trait objects.

use std::time::Duration;

use serde_json::Value;

use crate::errors::MessagingError;

use super::memory::InMemoryQueue;
use super::pgmq::PgmqQueue;
use super::types::{RawMessage, ReceiptHandle};

/// The messaging backend in use
#[derive(Debug, Clone)]
pub enum MessagingProvider {
    Pgmq(PgmqQueue),
    InMemory(InMemoryQueue),
}

impl MessagingProvider {
    #[must_use]
    pub fn pgmq(pool: sqlx::PgPool) -> Self {
        Self::Pgmq(PgmqQueue::new(pool))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryQueue::new())
    }

    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Pgmq(_) => "pgmq",
            Self::InMemory(_) => "in_memory",
        }
    }

    pub async fn create_queue(&self, queue: &str) -> Result<(), MessagingError> {
        match self {
            Self::Pgmq(q) => q.create_queue(queue).await,
            Self::InMemory(q) => q.create_queue(queue),
        }
    }

    pub async fn send(&self, queue: &str, body: &Value) -> Result<i64, MessagingError> {
        match self {
            Self::Pgmq(q) => q.send(queue, body).await,
            Self::InMemory(q) => q.send(queue, body),
        }
    }

    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<RawMessage>, MessagingError> {
        match self {
            Self::Pgmq(q) => q.read(queue, visibility_timeout, limit).await,
            Self::InMemory(q) => q.read(queue, visibility_timeout, limit),
        }
    }

    pub async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        match self {
            Self::Pgmq(q) => q.delete(receipt).await,
            Self::InMemory(q) => q.delete(receipt),
        }
    }

    pub async fn release(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        match self {
            Self::Pgmq(q) => q.release(receipt).await,
            Self::InMemory(q) => q.release(receipt),
        }
    }
}
