//! # pulse-events
//!
//! Typed events and the in-process event bus for the pulse billing engine.
//!
//! ## Design Principles
//!
//! - Events are immutable once created
//! - Every event belongs to exactly one account and one [`EventType`]
//! - Storage is bounded: each type keeps at most `max_count` events no older
//!   than `max_age`, evicted lazily on insert and read
//! - Delivery to subscribers never blocks producers; a full queue drops the
//!   event for that subscriber only
//!
//! ## Components
//!
//! - [`BoundedTimeStore`]: per-type, timestamp-ordered record store
//! - [`EventManager`]: owns one store per type plus the subscription table
//! - [`Request`] / [`Subscription`]: filters and live delivery queues
//! - [`BillOpts`]: billing context carried by `bill` events

mod bill;
mod error;
mod manager;
mod retention;
mod store;
mod types;
mod watch;

pub use bill::*;
pub use error::EventError;
pub use manager::{EventManager, ManagerConfig, WatchStats};
pub use retention::{RetentionConfig, RetentionPolicy};
pub use store::BoundedTimeStore;
pub use types::*;
pub use watch::{Request, Subscription};
