//! # pulse-id
//!
//! Typed identifiers used across the pulse event bus and billing engine.
//!
//! Two families of identifiers live here:
//!
//! - **Generated IDs** (`SkewId`, `RequestId`): ULID-backed, prefixed
//!   `{prefix}_{ulid}`, minted by this system. They sort by creation time.
//! - **External keys** (`AccountId`, `ResourceId`): opaque strings owned by
//!   the surrounding control plane (account emails, assembly ids). They are
//!   only checked for emptiness and surrounding whitespace.
//!
//! `WatchId` is a plain monotonic counter handed out by the event manager.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
