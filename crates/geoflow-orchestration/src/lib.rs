//! # geoflow-orchestration
//!
//! The orchestration engine: drives jobs from queued submission through
//! per-stage task fan-out to a terminal status. All coordination runs
//! through the state store's compare-and-set operations; the engine
//! itself is stateless and safe to run in any number of processes.

pub mod orchestration;

pub use orchestration::core_machine::{CoreMachine, JobMessageOutcome};
pub use orchestration::processor::JobQueueProcessor;
pub use orchestration::reconciler::{Reconciler, SweepReport};
pub use orchestration::stage_advancer::{StageAdvancer, StageOutcome};
pub use orchestration::submission::{SubmissionReceipt, SubmissionService};
