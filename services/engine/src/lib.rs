//! fleet scheduling engine
//!
//! One engine candidate per control-plane process competes for the leader
//! lease. The leader watches the registry and assigns units to machines:
//!
//! ```text
//! Idle ──(lease acquired)──▶ Watching ──(event / sweep)──▶ Scheduling
//!   ▲                            ▲                              │
//!   │                            └──────────(pass done)─────────┘
//!   └──────────(lease lost)──────────────────────────────────────
//! ```
//!
//! Placement claims are compare-and-swap writes, so two engines that both
//! believe they lead can never double-place a unit; the lease guard is checked
//! before every write so a deposed leader stops promptly.

pub mod config;
mod error;
pub mod leader;
pub mod scheduler;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use leader::{EngineState, Leadership};
pub use scheduler::{
    select_machine, ClusterSnapshot, Decision, ReconcileStats, SchedulerReconciler,
    SchedulerWorker,
};
