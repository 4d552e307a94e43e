//! # Messaging
//!
//! Durable, at-least-once messaging between the orchestrator and task
//! workers. Messages carry only identifiers; the authoritative state
//! lives in the store, so a redelivered message always finds the latest
//! state.
//!
//! The layer follows enum dispatch throughout: a [`MessagingProvider`]
//! enum over the concrete backends, wrapped by the domain-level
//! [`QueueClient`] facade that owns queue-name resolution and dead-letter
//! handling. No trait objects.

pub mod client;
pub mod memory;
pub mod messages;
pub mod pgmq;
pub mod provider;
pub mod types;

pub use client::{QueueClient, QueueNames};
pub use memory::InMemoryQueue;
pub use messages::QueueMessage;
pub use pgmq::PgmqQueue;
pub use provider::MessagingProvider;
pub use types::{QueuedMessage, RawMessage, ReceiptHandle};
