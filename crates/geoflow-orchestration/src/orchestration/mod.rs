pub mod core_machine;
pub mod processor;
pub mod reconciler;
pub mod stage_advancer;
pub mod submission;
