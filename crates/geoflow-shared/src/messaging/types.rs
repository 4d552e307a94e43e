//! Shared messaging value types.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::messages::QueueMessage;

/// Opaque handle identifying one delivery of one message; required for
/// acknowledge, release, and dead-letter operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    /// Queue the message was read from
    pub queue: String,
    /// Backend message id
    pub message_id: i64,
}

impl ReceiptHandle {
    pub fn new(queue: impl Into<String>, message_id: i64) -> Self {
        Self {
            queue: queue.into(),
            message_id,
        }
    }
}

/// An undecoded delivery as returned by a provider
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub receipt: ReceiptHandle,
    /// How many times this message has been delivered, including this one
    pub delivery_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub body: Value,
}

/// A decoded delivery handed to message processors
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: QueueMessage,
    pub receipt: ReceiptHandle,
    pub delivery_count: i32,
}
