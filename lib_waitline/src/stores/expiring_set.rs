//! # Expiring Set
//!
//! Tracks the turns that currently hold access to a resource together with
//! the instant their access runs out.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

use crate::error::StoreError;

/// A set of turns, each with a deadline.
pub trait ExpiringSet: Send + Sync {
    /// Inserts `member`, or moves its deadline to `expire_at` if present.
    fn add(&self, member: u64, expire_at: Instant) -> Result<(), StoreError>;

    /// Removes `member`. Returns whether it was present, expired or not.
    fn remove(&self, member: u64) -> Result<bool, StoreError>;

    /// Whether `member` is present with a deadline after `now`.
    fn contains(&self, member: u64, now: Instant) -> Result<bool, StoreError>;

    /// Removes and returns every member whose deadline is at or before `now`,
    /// in ascending order.
    fn take_expired(&self, now: Instant) -> Result<Vec<u64>, StoreError>;

    /// Number of members, expired ones included until they are taken.
    fn len(&self) -> Result<usize, StoreError>;
}

/// Process-local [`ExpiringSet`].
#[derive(Default)]
pub struct MemoryExpiringSet {
    deadlines: Mutex<HashMap<u64, Instant>>,
}

impl MemoryExpiringSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn deadlines(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Instant>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExpiringSet for MemoryExpiringSet {
    fn add(&self, member: u64, expire_at: Instant) -> Result<(), StoreError> {
        self.deadlines().insert(member, expire_at);
        Ok(())
    }

    fn remove(&self, member: u64) -> Result<bool, StoreError> {
        Ok(self.deadlines().remove(&member).is_some())
    }

    fn contains(&self, member: u64, now: Instant) -> Result<bool, StoreError> {
        Ok(self
            .deadlines()
            .get(&member)
            .is_some_and(|deadline| *deadline > now))
    }

    fn take_expired(&self, now: Instant) -> Result<Vec<u64>, StoreError> {
        let mut deadlines = self.deadlines();
        let mut expired: Vec<u64> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(member, _)| *member)
            .collect();
        for member in &expired {
            deadlines.remove(member);
        }
        expired.sort_unstable();
        Ok(expired)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.deadlines().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_remove_reports_presence() {
        let set = MemoryExpiringSet::new();
        let now = Instant::now();
        set.add(7, now + Duration::from_secs(10)).unwrap();
        assert!(set.remove(7).unwrap());
        assert!(!set.remove(7).unwrap());
    }

    #[test]
    fn test_expired_members_are_not_contained_but_still_removable() {
        let set = MemoryExpiringSet::new();
        let now = Instant::now();
        set.add(3, now).unwrap();
        assert!(!set.contains(3, now).unwrap());
        assert!(set.remove(3).unwrap());
    }

    #[test]
    fn test_add_refreshes_deadline() {
        let set = MemoryExpiringSet::new();
        let now = Instant::now();
        set.add(1, now + Duration::from_secs(1)).unwrap();
        set.add(1, now + Duration::from_secs(60)).unwrap();
        assert_eq!(set.len().unwrap(), 1);
        assert!(set.contains(1, now + Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn test_take_expired_drains_only_due_members() {
        let set = MemoryExpiringSet::new();
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        set.add(9, start).unwrap();
        set.add(2, now).unwrap();
        set.add(5, now + Duration::from_secs(5)).unwrap();

        assert_eq!(set.take_expired(now).unwrap(), vec![2, 9]);
        assert_eq!(set.len().unwrap(), 1);
        assert!(set.take_expired(now).unwrap().is_empty());
    }
}
