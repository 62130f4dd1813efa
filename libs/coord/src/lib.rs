//! # fleet-coord
//!
//! Typed client abstraction over a strongly-consistent key-value store.
//!
//! Everything else in the control plane is built on the [`Store`] trait:
//!
//! - **Atomic writes**: `compare_and_swap` / `compare_and_delete` on a single
//!   key are the only atomicity primitive. Callers must expect
//!   [`CoordError::CasFailed`] and re-read.
//! - **Leases**: TTL-bound grants. Keys attached to a lease disappear when the
//!   lease expires or is revoked; [`LeaseHandle`] wraps grant/renew/release.
//! - **Watches**: [`watch_prefix`] yields an initial snapshot followed by the
//!   ordered mutations under a prefix. Every mutation carries a monotonic
//!   index; a detected gap triggers a full re-list of the prefix.
//!
//! [`MemoryStore`] is the in-process implementation used by the dev cluster
//! and by every test in the workspace.
//!
//! Connection loss surfaces as [`CoordError::Unavailable`] and bounded
//! operations as [`CoordError::Timeout`]; both are transient.

mod error;
mod lease;
mod memory;
mod store;
mod watch;

pub use error::{CoordError, CoordResult};
pub use lease::{LeaseGuard, LeaseHandle};
pub use memory::MemoryStore;
pub use store::{
    with_timeout, EventKind, Index, KeyValue, LeaseId, Precondition, Snapshot, Store, WatchEvent,
};
pub use watch::{watch_prefix, Watch, WatchUpdate};
