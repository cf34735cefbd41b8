//! # Counter Store
//!
//! The in-memory implementation gives every key its own `Mutex<u64>`. The key
//! map is only locked to find (or create) a counter cell and is released
//! before the cell itself is locked, so two counters never contend with each
//! other and no lock is ever held while acquiring another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::StoreError;

/// Atomic named counters.
///
/// Implementations must linearize `increment` per key: no two callers may
/// observe the same returned value for the same key.
pub trait CounterStore: Send + Sync {
    /// Sets `key` to `value` if it does not exist yet and returns the value
    /// now stored.
    fn init(&self, key: &str, value: u64) -> Result<u64, StoreError>;

    /// Atomically adds one to `key` (starting from 0 if absent) and returns
    /// the new value. Fails instead of wrapping.
    fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Reads `key`; an absent key reads as 0.
    fn get(&self, key: &str) -> Result<u64, StoreError>;
}

/// Process-local [`CounterStore`].
#[derive(Default)]
pub struct MemoryCounterStore {
    cells: RwLock<HashMap<String, Arc<Mutex<u64>>>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_cell(&self, key: &str) -> Option<Arc<Mutex<u64>>> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).cloned()
    }

    /// Returns the cell for `key`, creating it with `initial` when missing.
    fn cell_or_insert(&self, key: &str, initial: u64) -> Arc<Mutex<u64>> {
        if let Some(cell) = self.existing_cell(key) {
            return cell;
        }
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(initial)))
            .clone()
    }
}

// A counter cell only ever holds a fully written u64, so a poisoned lock still
// guards a consistent value and is recovered rather than propagated.
impl CounterStore for MemoryCounterStore {
    fn init(&self, key: &str, value: u64) -> Result<u64, StoreError> {
        let cell = self.cell_or_insert(key, value);
        let current = *cell.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(current)
    }

    fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let cell = self.cell_or_insert(key, 0);
        let mut value = cell.lock().unwrap_or_else(PoisonError::into_inner);
        let next = value
            .checked_add(1)
            .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
        *value = next;
        Ok(next)
    }

    fn get(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .existing_cell(key)
            .map(|cell| *cell.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_increment_starts_from_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get("a:turn").unwrap(), 0);
        assert_eq!(store.increment("a:turn").unwrap(), 1);
        assert_eq!(store.increment("a:turn").unwrap(), 2);
        assert_eq!(store.get("a:turn").unwrap(), 2);
    }

    #[test]
    fn test_init_only_sets_absent_keys() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.init("a:in", 5).unwrap(), 5);
        store.increment("a:in").unwrap();
        // A second init must not reset a live counter.
        assert_eq!(store.init("a:in", 5).unwrap(), 6);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryCounterStore::new();
        store.increment("a:turn").unwrap();
        store.increment("a:turn").unwrap();
        store.increment("b:turn").unwrap();
        assert_eq!(store.get("a:turn").unwrap(), 2);
        assert_eq!(store.get("b:turn").unwrap(), 1);
    }

    #[test]
    fn test_overflow_is_refused_without_wrapping() {
        let store = MemoryCounterStore::new();
        store.init("big", u64::MAX).unwrap();
        assert_eq!(
            store.increment("big"),
            Err(StoreError::Overflow("big".to_string()))
        );
        assert_eq!(store.get("big").unwrap(), u64::MAX);
    }

    #[test]
    fn test_concurrent_increments_are_unique() {
        let store = Arc::new(MemoryCounterStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|_| store.increment("k").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=2000).collect::<Vec<_>>());
    }
}
