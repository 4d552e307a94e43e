//! # geoflow-worker
//!
//! Task execution for the geoflow core: workers lease task messages,
//! run the registered handler under a timeout, persist the outcome, and
//! — when the store elects them — close the stage they just emptied.

pub mod worker;

pub use worker::executor::{ExecutionOutcome, TaskExecutor};
pub use worker::processor::TaskQueueProcessor;
