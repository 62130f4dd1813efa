//! # fleet-registry
//!
//! Shared view of cluster state on top of the coordination store.
//!
//! The registry holds four record families:
//!
//! - **Units**: desired workloads and their target state
//! - **Machines**: live agent hosts, each record attached to the agent's lease
//! - **Placements**: at most one machine per unit, claimed by compare-and-swap
//! - **Runtime state**: per-(unit, machine) observations written by agents
//!
//! Desired state (unit target) and observed state (placement state, runtime
//! records) are stored independently; agents are responsible for convergence.
//!
//! Components depend on a capability trait ([`SubmitRegistry`],
//! [`SchedulerRegistry`], [`AgentRegistry`]) rather than on [`Registry`]
//! directly.

mod capability;
mod error;
pub mod keys;
mod model;
mod registry;
pub mod signing;
pub mod submit;
mod watch;

pub use capability::{AgentRegistry, SchedulerRegistry, SubmitRegistry};
pub use error::{RegistryError, RegistryResult};
pub use model::{
    ClusterVersion, LeaderRecord, Machine, Placement, ProcessStatus, ReportOutcome, Requirements,
    RuntimeState, TargetState, Unit, UnitState,
};
pub use registry::{Registry, RegistryConfig};
pub use signing::{DigestSigner, PayloadSigner, PayloadVerifier};
pub use submit::{parse_requirements, ScheduleStatus, Submitter};
pub use watch::{RegistryEvent, RegistryWatch};
