//! Scheduler module for unit placement.
//!
//! The scheduler is responsible for:
//! - Assigning units that want a placement to an eligible machine
//! - Moving units off machines whose lease has expired
//! - Releasing placements of destroyed or unloaded units

pub mod constraints;
mod reconciler;
mod worker;

pub use reconciler::{
    select_machine, ClusterSnapshot, Decision, ReconcileStats, SchedulerReconciler,
};
pub use worker::SchedulerWorker;
