//! # Served Turns
//!
//! Remembers which turns already had their access counted (released or
//! reclaimed), so a tracked line can refuse to grant them a second time.
//!
//! Turns are mostly served in order, so the in-memory set keeps a floor
//! below which every turn is served plus the sparse turns served ahead of
//! it. Memory follows how far out of order turns finish, not how many were
//! served.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;

/// A set of turns that only shrinks to roll back a failed step.
pub trait ServedTurns: Send + Sync {
    /// Records `turn`. Returns `false` if it was already recorded.
    fn mark(&self, turn: u64) -> Result<bool, StoreError>;

    /// Forgets `turn` again. No-op if it was not recorded.
    fn unmark(&self, turn: u64) -> Result<(), StoreError>;

    /// Whether `turn` has been recorded.
    fn is_served(&self, turn: u64) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Watermark {
    // Every turn in 1..=floor is served
    floor: u64,
    above: BTreeSet<u64>,
}

/// Process-local [`ServedTurns`].
#[derive(Default)]
pub struct MemoryServedTurns {
    inner: Mutex<Watermark>,
}

impl MemoryServedTurns {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest turn below which every turn is served.
    pub fn floor(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).floor
    }
}

impl ServedTurns for MemoryServedTurns {
    fn mark(&self, turn: u64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if turn <= inner.floor || !inner.above.insert(turn) {
            return Ok(false);
        }
        while let Some(next) = inner.floor.checked_add(1) {
            if !inner.above.remove(&next) {
                break;
            }
            inner.floor = next;
        }
        Ok(true)
    }

    fn unmark(&self, turn: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if turn == 0 || turn > inner.floor {
            inner.above.remove(&turn);
            return Ok(());
        }
        // Split the floor at `turn`
        let floor = inner.floor;
        inner.above.extend(turn + 1..=floor);
        inner.floor = turn - 1;
        Ok(())
    }

    fn is_served(&self, turn: u64) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((turn > 0 && turn <= inner.floor) || inner.above.contains(&turn))
    }
}
