//! Typed identifier definitions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{define_id, define_key};

// =============================================================================
// External keys
// =============================================================================

define_key!(AccountId, "account id");
define_key!(ResourceId, "resource id");

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(SkewId, "skw");
define_id!(RequestId, "req");

// =============================================================================
// Watches
// =============================================================================

/// Identifier of a live subscription on the event manager.
///
/// Allocated from a [`WatchIdAllocator`]; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

impl WatchId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

impl serde::Serialize for WatchId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for WatchId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self)
    }
}

/// Monotonic source of [`WatchId`]s. Starts at 1.
#[derive(Debug)]
pub struct WatchIdAllocator {
    next: AtomicU64,
}

impl WatchIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> WatchId {
        WatchId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for WatchIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
