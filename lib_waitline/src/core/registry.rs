//! # Line Registry
//!
//! Maps resource ids to their `Line`. Built once at startup and shared
//! (`Arc<LineRegistry>`) with every component that resolves a resource.
//!
//! Lookups hit a sharded concurrent map without taking any exclusive lock.
//! On a miss the shard's entry lock is taken, the lookup is repeated under it
//! and the line is constructed only if still absent, so concurrent callers
//! for the same id always end up with the same instance and construction runs
//! exactly once.
//!
//! Lines stay until they are evicted explicitly; there is no automatic
//! eviction policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::line::{Line, LineConfig};
use crate::error::LineError;
use crate::stores::{LineBackend, MemoryBackend};

/// Process-wide resource id -> `Line` cache.
pub struct LineRegistry {
    lines: DashMap<String, Arc<Line>>,
    defaults: LineConfig,
    backend: Arc<dyn LineBackend>,
    lines_created: AtomicU64,
}

impl LineRegistry {
    /// Creates an empty registry. Every line it builds uses `defaults` and
    /// `backend`.
    pub fn new(defaults: LineConfig, backend: Arc<dyn LineBackend>) -> Result<Self, LineError> {
        defaults.validate()?;
        Ok(Self {
            lines: DashMap::new(),
            defaults,
            backend,
            lines_created: AtomicU64::new(0),
        })
    }

    /// A registry on a fresh in-memory backend.
    pub fn in_memory(defaults: LineConfig) -> Result<Self, LineError> {
        Self::new(defaults, Arc::new(MemoryBackend::new()))
    }

    /// Returns the line for `resource_id`, building it on first use.
    ///
    /// # Panics
    /// Building a line spawns its first broadcaster, so a miss must happen
    /// inside a Tokio runtime.
    pub fn get_or_create(&self, resource_id: &str) -> Result<Arc<Line>, LineError> {
        if let Some(line) = self.lines.get(resource_id) {
            return Ok(line.value().clone());
        }

        match self.lines.entry(resource_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let line = Arc::new(Line::new(
                    resource_id,
                    self.defaults.clone(),
                    self.backend.as_ref(),
                )?);
                self.lines_created.fetch_add(1, Ordering::Relaxed);
                entry.insert(line.clone());
                Ok(line)
            }
        }
    }

    /// The line for `resource_id`, if it was ever created and not evicted.
    pub fn get(&self, resource_id: &str) -> Option<Arc<Line>> {
        self.lines.get(resource_id).map(|line| line.value().clone())
    }

    /// Drops `resource_id` from the registry and stops its broadcasters.
    /// The backend keeps the line's counters, in-service turns and served
    /// turns, so a later `get_or_create` resumes where the line left off and
    /// accesses granted before eviction are still released or reclaimed.
    /// Subscribers are not carried over.
    pub fn evict(&self, resource_id: &str) -> Option<Arc<Line>> {
        let (_, line) = self.lines.remove(resource_id)?;
        line.shutdown();
        log::info!("Line '{}' evicted", resource_id);
        Some(line)
    }

    /// Snapshot of every registered line.
    pub fn lines(&self) -> Vec<Arc<Line>> {
        self.lines.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of every registered resource id.
    pub fn ids(&self) -> Vec<String> {
        self.lines.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no line is registered.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// How many lines this registry has ever constructed.
    pub fn lines_created(&self) -> u64 {
        self.lines_created.load(Ordering::Relaxed)
    }

    /// Configuration every new line is built with.
    pub fn defaults(&self) -> &LineConfig {
        &self.defaults
    }

    /// Stops the broadcasters of every registered line.
    pub fn shutdown(&self) {
        for line in self.lines() {
            line.shutdown();
        }
    }
}
