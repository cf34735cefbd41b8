//! # Subscriber Pools
//!
//! A line's subscribers are split into fixed-capacity pools, each served by
//! its own broadcaster. Bounding the pool size bounds how many sockets one
//! broadcast iteration touches and how far one slow member can delay its
//! neighbours.
//!
//! ## Invariants
//! - Pools fill in creation order: pool `i` is sealed before pool `i + 1`
//!   exists.
//! - A sealed pool never gains members, even after pruning shrinks it.
//! - Pools are never merged, reordered or removed from their line.
//!
//! ## Locking
//! Slot selection happens under the pool-collection lock but only touches a
//! pool's atomic reservation counter. The member itself is pushed into the
//! pool's own mutex after the collection lock is released, so the two locks
//! are never held together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::subscriber::{SendCapable, SubscriberId};

/// A subscriber inside a pool, with its current run of failed sends.
pub(crate) struct Member {
    id: SubscriberId,
    handle: Arc<dyn SendCapable>,
    failures: u32,
}

impl Member {
    pub(crate) fn new(id: SubscriberId, handle: Arc<dyn SendCapable>) -> Self {
        Self {
            id,
            handle,
            failures: 0,
        }
    }
}

/// A bounded batch of subscribers sharing one broadcaster.
pub struct SubscriberPool {
    index: usize,
    capacity: usize,
    /// Slots handed out so far; never exceeds `capacity`.
    reserved: AtomicUsize,
    /// Members actually pushed so far.
    joined: AtomicUsize,
    sealed: AtomicBool,
    members: Mutex<Vec<Member>>,
}

impl SubscriberPool {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            capacity,
            reserved: AtomicUsize::new(0),
            joined: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            members: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    fn members(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims one slot. Seals the pool when the last slot goes.
    fn try_reserve(&self) -> bool {
        let claimed = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < self.capacity).then_some(taken + 1)
            });
        match claimed {
            Ok(previous) => {
                if previous + 1 == self.capacity {
                    self.sealed.store(true, Ordering::Release);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn push(&self, member: Member) {
        let mut members = self.members();
        members.push(member);
        self.joined.fetch_add(1, Ordering::AcqRel);
    }

    /// Position of this pool in its line, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Maximum number of members this pool ever holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of members.
    pub fn len(&self) -> usize {
        self.members().len()
    }

    /// Whether the pool currently has no members.
    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    /// Whether the pool has been filled once. Full pools stay full for the
    /// purpose of admission, even after members are pruned.
    pub fn is_full(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Ids of current members, in join order.
    pub fn member_ids(&self) -> Vec<SubscriberId> {
        self.members().iter().map(|m| m.id).collect()
    }

    /// Sealed, every reserved member has joined, and all of them are gone.
    /// Nothing will ever be broadcast from this pool again.
    pub(crate) fn is_drained(&self) -> bool {
        let members = self.members();
        self.is_full() && self.joined.load(Ordering::Acquire) == self.capacity && members.is_empty()
    }

    /// Handles to push to, taken without holding the lock during I/O.
    pub(crate) fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn SendCapable>)> {
        self.members()
            .iter()
            .map(|m| (m.id, m.handle.clone()))
            .collect()
    }

    /// Applies the outcome of one broadcast iteration. Delivered members get
    /// their failure run reset; failed members get it extended and are pruned
    /// once it reaches `max_failures`. Returns the pruned ids.
    pub(crate) fn record_outcomes(
        &self,
        delivered: &[SubscriberId],
        failed: &[SubscriberId],
        max_failures: u32,
    ) -> Vec<SubscriberId> {
        let mut members = self.members();
        for member in members.iter_mut() {
            if delivered.contains(&member.id) {
                member.failures = 0;
            } else if failed.contains(&member.id) {
                member.failures = member.failures.saturating_add(1);
            }
        }

        let mut pruned = Vec::new();
        members.retain(|member| {
            if member.failures >= max_failures {
                pruned.push(member.id);
                false
            } else {
                true
            }
        });
        pruned
    }
}

/// The ordered pool sequence of one line.
pub(crate) struct PoolManager {
    capacity: usize,
    pools: Mutex<Vec<Arc<SubscriberPool>>>,
}

impl PoolManager {
    /// Creates the manager together with its first, empty pool.
    pub(crate) fn new(capacity: usize) -> (Self, Arc<SubscriberPool>) {
        let first = Arc::new(SubscriberPool::new(0, capacity));
        let manager = Self {
            capacity,
            pools: Mutex::new(vec![first.clone()]),
        };
        (manager, first)
    }

    /// Places `member` into the current pool, opening a new pool first when
    /// the current one is full. Returns the pool used and whether it was
    /// created by this call.
    pub(crate) fn append_subscriber(&self, member: Member) -> (Arc<SubscriberPool>, bool) {
        let (pool, created) = {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            let current = pools
                .last()
                .filter(|current| current.try_reserve())
                .cloned();
            match current {
                Some(current) => (current, false),
                None => {
                    let pool = Arc::new(SubscriberPool::new(pools.len(), self.capacity));
                    pool.try_reserve();
                    pools.push(pool.clone());
                    (pool, true)
                }
            }
        };
        pool.push(member);
        (pool, created)
    }

    pub(crate) fn pools(&self) -> Vec<Arc<SubscriberPool>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
