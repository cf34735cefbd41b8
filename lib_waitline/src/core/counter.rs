//! # Turn and Admission Counters
//!
//! `next_turn` and `next_in` are two independent counters. Each is linearized
//! on its own; nothing orders a read of one against a write of the other.

use std::sync::Arc;

use crate::error::LineError;
use crate::stores::CounterStore;

/// A sequential ticket number. Turns start at 1.
pub type Turn = u64;

/// Validates a turn that arrived from outside the process (query string,
/// cookie, message body). Only positive decimal integers are accepted.
pub fn parse_turn(raw: &str) -> Result<Turn, LineError> {
    let trimmed = raw.trim();
    let turn: Turn = trimmed
        .parse()
        .map_err(|_| LineError::InvalidTurn(format!("'{}' is not a turn number", trimmed)))?;
    if turn == 0 {
        return Err(LineError::InvalidTurn("turns start at 1".to_string()));
    }
    Ok(turn)
}

/// Issues strictly increasing, never reused turns for one line.
pub struct TicketCounter {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl TicketCounter {
    /// Binds the counter to `<line_id>:turn`, seeding it with 0 so the first
    /// issued turn is 1.
    pub fn new(store: Arc<dyn CounterStore>, line_id: &str) -> Result<Self, LineError> {
        let key = format!("{}:turn", line_id);
        store.init(&key, 0)?;
        Ok(Self { store, key })
    }

    /// Draws the next turn.
    pub fn issue_turn(&self) -> Result<Turn, LineError> {
        Ok(self.store.increment(&self.key)?)
    }

    /// The most recently issued turn, 0 if none yet.
    pub fn last_issued(&self) -> Result<Turn, LineError> {
        Ok(self.store.get(&self.key)?)
    }
}

/// Tracks the highest turn currently granted access.
pub struct AdmissionGate {
    store: Arc<dyn CounterStore>,
    key: String,
}

impl AdmissionGate {
    /// Binds the gate to `<line_id>:in`, seeded with `initial` if the counter
    /// does not exist yet.
    pub fn new(
        store: Arc<dyn CounterStore>,
        line_id: &str,
        initial: u64,
    ) -> Result<Self, LineError> {
        let key = format!("{}:in", line_id);
        store.init(&key, initial)?;
        Ok(Self { store, key })
    }

    /// Plain read of `next_in`.
    pub fn current_admission(&self) -> Result<u64, LineError> {
        Ok(self.store.get(&self.key)?)
    }

    /// Unconditionally lets one more turn in and returns the new admission
    /// value. Whether a release is allowed to reach this point is decided by
    /// the line's `ReleasePolicy`.
    pub fn advance(&self) -> Result<u64, LineError> {
        Ok(self.store.increment(&self.key)?)
    }

    /// `turn <= next_in`, recomputed on every call.
    pub fn is_admitted(&self, turn: Turn) -> Result<bool, LineError> {
        Ok(turn <= self.current_admission()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryCounterStore;

    fn store() -> Arc<dyn CounterStore> {
        Arc::new(MemoryCounterStore::new())
    }

    #[test]
    fn test_turns_are_contiguous_from_one() {
        let counter = TicketCounter::new(store(), "r1").unwrap();
        let turns: Vec<Turn> = (0..5).map(|_| counter.issue_turn().unwrap()).collect();
        assert_eq!(turns, vec![1, 2, 3, 4, 5]);
        assert_eq!(counter.last_issued().unwrap(), 5);
    }

    #[test]
    fn test_gate_starts_at_initial_and_advances_by_one() {
        let gate = AdmissionGate::new(store(), "r1", 1).unwrap();
        assert_eq!(gate.current_admission().unwrap(), 1);
        assert_eq!(gate.advance().unwrap(), 2);
        assert_eq!(gate.advance().unwrap(), 3);
        assert_eq!(gate.current_admission().unwrap(), 3);
    }

    #[test]
    fn test_is_admitted_tracks_current_value() {
        let gate = AdmissionGate::new(store(), "r1", 2).unwrap();
        assert!(gate.is_admitted(1).unwrap());
        assert!(gate.is_admitted(2).unwrap());
        assert!(!gate.is_admitted(3).unwrap());
        gate.advance().unwrap();
        assert!(gate.is_admitted(3).unwrap());
    }

    #[test]
    fn test_counters_share_a_store_without_interfering() {
        let shared = store();
        let counter = TicketCounter::new(shared.clone(), "r1").unwrap();
        let gate = AdmissionGate::new(shared, "r1", 1).unwrap();
        counter.issue_turn().unwrap();
        counter.issue_turn().unwrap();
        assert_eq!(gate.current_admission().unwrap(), 1);
    }

    #[test]
    fn test_parse_turn_rejects_garbage_and_zero() {
        assert_eq!(parse_turn(" 42 ").unwrap(), 42);
        assert!(matches!(parse_turn("0"), Err(LineError::InvalidTurn(_))));
        assert!(matches!(parse_turn("-3"), Err(LineError::InvalidTurn(_))));
        assert!(matches!(parse_turn("12,IN"), Err(LineError::InvalidTurn(_))));
        assert!(matches!(parse_turn(""), Err(LineError::InvalidTurn(_))));
    }
}
