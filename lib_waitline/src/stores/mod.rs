//! # Store Seams
//!
//! A `Line` never touches its counters or its in-service bookkeeping
//! directly. It goes through two capabilities:
//!
//! - **`CounterStore`**: named, atomic, monotonically increasing counters.
//!   Each line keeps two of them, `<id>:turn` and `<id>:in`.
//! - **`ExpiringSet`**: the turns currently holding access, each with a
//!   deadline after which the access is reclaimed.
//! - **`ServedTurns`**: the turns whose access was already counted, consulted
//!   by lines running `ReleasePolicy::Tracked`.
//!
//! A [`LineBackend`] hands these to a line at construction time. The in-memory
//! backend is the only one shipped; a shared store can be slotted in by
//! implementing the traits without touching the line algorithm.

/// Named atomic counters.
pub mod counter_store;
/// Members with deadlines.
pub mod expiring_set;
/// Turns already counted.
pub mod served_turns;

use std::sync::Arc;

use dashmap::DashMap;

pub use counter_store::{CounterStore, MemoryCounterStore};
pub use expiring_set::{ExpiringSet, MemoryExpiringSet};
pub use served_turns::{MemoryServedTurns, ServedTurns};

/// Supplies the stores a `Line` is built on.
pub trait LineBackend: Send + Sync {
    /// The counter store shared by every line of this backend. Keys are
    /// namespaced by the line id, so one store serves all lines.
    fn counters(&self) -> Arc<dyn CounterStore>;

    /// The in-service turns of `line_id`. Asking twice for the same id
    /// yields the same set, so a line rebuilt after eviction still sees the
    /// accesses granted before it.
    fn in_service_set(&self, line_id: &str) -> Arc<dyn ExpiringSet>;

    /// The served turns of `line_id`, with the same per-id identity.
    fn served_turns(&self, line_id: &str) -> Arc<dyn ServedTurns>;
}

/// Process-local backend: one shared [`MemoryCounterStore`], and one
/// [`MemoryExpiringSet`] plus one [`MemoryServedTurns`] per line id, kept for
/// the life of the backend.
#[derive(Default)]
pub struct MemoryBackend {
    counters: Arc<MemoryCounterStore>,
    in_service: DashMap<String, Arc<MemoryExpiringSet>>,
    served: DashMap<String, Arc<MemoryServedTurns>>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineBackend for MemoryBackend {
    fn counters(&self) -> Arc<dyn CounterStore> {
        self.counters.clone()
    }

    fn in_service_set(&self, line_id: &str) -> Arc<dyn ExpiringSet> {
        self.in_service
            .entry(line_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn served_turns(&self, line_id: &str) -> Arc<dyn ServedTurns> {
        self.served
            .entry(line_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}
