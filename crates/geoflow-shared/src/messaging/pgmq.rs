//! # PGMQ Provider
//!
//! Durable queue operations through the PGMQ SQL API on the shared
//! PostgreSQL pool (`pgmq.create` / `send` / `read` / `delete` /
//! `set_vt`). Visibility timeouts give per-message leases: a message that
//! is read but never deleted becomes visible again when its lease
//! expires, which is the whole redelivery mechanism.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::errors::MessagingError;

use super::types::{RawMessage, ReceiptHandle};

/// PGMQ-backed queue provider
#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pool: PgPool,
}

impl PgmqQueue {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a queue if it does not already exist.
    pub async fn create_queue(&self, queue: &str) -> Result<(), MessagingError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Send one message; returns the backend message id.
    pub async fn send(&self, queue: &str, body: &Value) -> Result<i64, MessagingError> {
        let msg_id: i64 = sqlx::query_scalar("SELECT * FROM pgmq.send($1, $2)")
            .bind(queue)
            .bind(body)
            .fetch_one(&self.pool)
            .await?;
        Ok(msg_id)
    }

    /// Read up to `limit` messages, leasing each for `visibility_timeout`.
    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<RawMessage>, MessagingError> {
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue)
        .bind(visibility_timeout.as_secs() as i32)
        .bind(limit as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let msg_id: i64 = row.try_get("msg_id")?;
            let read_ct: i32 = row.try_get("read_ct")?;
            let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
            let body: Value = row.try_get("message")?;
            messages.push(RawMessage {
                receipt: ReceiptHandle::new(queue, msg_id),
                delivery_count: read_ct,
                enqueued_at,
                body,
            });
        }
        Ok(messages)
    }

    /// Acknowledge (permanently remove) a delivered message.
    pub async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&receipt.queue)
            .bind(receipt.message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make a leased message immediately visible again.
    pub async fn release(&self, receipt: &ReceiptHandle) -> Result<(), MessagingError> {
        sqlx::query("SELECT * FROM pgmq.set_vt($1, $2, $3)")
            .bind(&receipt.queue)
            .bind(receipt.message_id)
            .bind(0_i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
