//! # fleet-id
//!
//! Typed identifiers for the fleet control plane.
//!
//! ## Design Principles
//!
//! - Unit names and machine IDs are operator-chosen strings, validated once at
//!   the edge and carried as newtypes afterwards
//! - Names are used verbatim as path segments in the coordination store, so
//!   they may never contain `/` or whitespace
//! - Engine candidate IDs are system-generated (`eng_{ulid}`)
//! - Typed wrappers prevent mixing a machine ID with a unit name
//!
//! ## Examples
//!
//! - Unit: `web.service`, `db@1.service`
//! - Machine: `m1`, `6f0a2c1e9b8d4f7a`
//! - Engine: `eng_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_NAME_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
