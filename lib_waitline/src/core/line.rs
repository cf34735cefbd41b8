//! # Line
//!
//! The queue for one contended resource: a ticket counter, an admission gate,
//! the in-service set and the subscriber pools with their broadcasters.
//!
//! Each piece of mutable state sits behind its own lock (or its own store
//! key). No operation holds two of them at once, and none of them performs
//! I/O while holding one, so a stalled subscriber can never hold up turn
//! issuance or release.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::broadcaster::Broadcaster;
use crate::core::counter::{AdmissionGate, TicketCounter, Turn};
use crate::core::pool::{Member, PoolManager, SubscriberPool};
use crate::core::subscriber::{SendCapable, SubscriberId};
use crate::error::LineError;
use crate::stores::{ExpiringSet, LineBackend, MemoryBackend, ServedTurns};

/// How `Line::release` treats the turn it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Every release advances admission, whatever turn is supplied.
    #[default]
    Permissive,
    /// Only a turn currently holding access may release, and only once.
    Tracked,
}

impl FromStr for ReleasePolicy {
    type Err = LineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "permissive" => Ok(ReleasePolicy::Permissive),
            "tracked" => Ok(ReleasePolicy::Tracked),
            other => Err(LineError::InvalidConfig(format!(
                "unknown release policy '{}'",
                other
            ))),
        }
    }
}

/// Fixed settings of a line. Set at construction, never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// Subscribers per pool.
    pub capacity: usize,
    /// How long a claimed access stays in service before it is reclaimed.
    pub access_max_age: Duration,
    /// How long an issued turn is advertised to its holder as valid.
    pub waiting_max_age: Duration,
    /// Starting value of the admission counter.
    pub initial_admission: u64,
    /// Period of every pool broadcaster.
    pub broadcast_interval: Duration,
    /// Upper bound on a single push to a single member.
    pub send_timeout: Duration,
    /// Consecutive failed pushes after which a member is pruned.
    pub max_send_failures: u32,
    /// See [`ReleasePolicy`].
    pub release_policy: ReleasePolicy,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            access_max_age: Duration::from_secs(600),
            waiting_max_age: Duration::from_secs(600),
            initial_admission: 1,
            broadcast_interval: Duration::from_secs(3),
            send_timeout: Duration::from_secs(1),
            max_send_failures: 3,
            release_policy: ReleasePolicy::Permissive,
        }
    }
}

impl LineConfig {
    /// Rejects values the line cannot run with.
    pub fn validate(&self) -> Result<(), LineError> {
        if self.capacity == 0 {
            return Err(LineError::InvalidConfig("capacity must be at least 1".into()));
        }
        if self.broadcast_interval.is_zero() {
            return Err(LineError::InvalidConfig(
                "broadcast_interval must be non-zero".into(),
            ));
        }
        if self.max_send_failures == 0 {
            return Err(LineError::InvalidConfig(
                "max_send_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Result of `Line::claim_access`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The turn is admitted and now holds access until `expires_at`.
    Granted {
        /// The claimed turn.
        turn: Turn,
        /// When the access is reclaimed unless released earlier.
        expires_at: Instant,
    },
    /// The queue has not reached this turn yet.
    NotYet {
        /// The turn that asked.
        turn: Turn,
        /// Admission at the time of the check.
        next_in: u64,
    },
}

/// Point-in-time view of a line, for status endpoints and logs.
///
/// The two counters are read one after the other; the pair is not an atomic
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineStatus {
    /// Resource id.
    pub resource: String,
    /// Last issued turn.
    pub next_turn: Turn,
    /// Current admission.
    pub next_in: u64,
    /// Subscribers per pool.
    pub capacity: usize,
    /// Number of pools created so far.
    pub pools: usize,
    /// Current subscribers across all pools.
    pub subscribers: usize,
    /// Turns currently holding access.
    pub in_service: usize,
}

/// The waiting line of one resource.
pub struct Line {
    id: Arc<str>,
    config: LineConfig,
    tickets: TicketCounter,
    gate: Arc<AdmissionGate>,
    in_service: Arc<dyn ExpiringSet>,
    served: Arc<dyn ServedTurns>,
    pools: PoolManager,
    cancel: CancellationToken,
}

impl Line {
    /// Builds a line on `backend` and starts the broadcaster of its first
    /// pool.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime, since it spawns a task.
    pub fn new(
        id: &str,
        config: LineConfig,
        backend: &dyn LineBackend,
    ) -> Result<Self, LineError> {
        config.validate()?;
        let counters = backend.counters();
        let tickets = TicketCounter::new(counters.clone(), id)?;
        let gate = Arc::new(AdmissionGate::new(counters, id, config.initial_admission)?);
        let (pools, first_pool) = PoolManager::new(config.capacity);

        let line = Self {
            id: Arc::from(id),
            in_service: backend.in_service_set(id),
            served: backend.served_turns(id),
            config,
            tickets,
            gate,
            pools,
            cancel: CancellationToken::new(),
        };
        line.spawn_broadcaster(first_pool);
        log::info!(
            "Line '{}' created (pool capacity {}, admission starts at {})",
            line.id,
            line.config.capacity,
            line.config.initial_admission
        );
        Ok(line)
    }

    /// A line on its own private in-memory backend.
    pub fn in_memory(id: &str, config: LineConfig) -> Result<Self, LineError> {
        Self::new(id, config, &MemoryBackend::new())
    }

    fn spawn_broadcaster(&self, pool: Arc<SubscriberPool>) {
        Broadcaster::new(
            self.id.clone(),
            pool,
            self.gate.clone(),
            self.config.broadcast_interval,
            self.config.send_timeout,
            self.config.max_send_failures,
            self.cancel.child_token(),
        )
        .spawn();
    }

    /// Draws the next turn. Turns are unique and contiguous from 1.
    pub fn issue_turn(&self) -> Result<Turn, LineError> {
        self.tickets.issue_turn()
    }

    /// The highest admitted turn.
    pub fn current_admission(&self) -> Result<u64, LineError> {
        self.gate.current_admission()
    }

    /// Whether `turn` may access the resource right now.
    pub fn is_admitted(&self, turn: Turn) -> Result<bool, LineError> {
        self.gate.is_admitted(turn)
    }

    /// Moves an admitted turn into service for `access_max_age`. Claiming
    /// again refreshes the deadline. A turn the queue has not reached yet
    /// gets `Access::NotYet`, which is an answer, not an error.
    ///
    /// Under `ReleasePolicy::Tracked` only issued turns that were never
    /// released or reclaimed can be claimed.
    pub fn claim_access(&self, turn: Turn) -> Result<Access, LineError> {
        if self.is_tracked() {
            if turn > self.tickets.last_issued()? {
                return Err(LineError::TurnNotIssued(turn));
            }
            if self.served.is_served(turn)? {
                return Err(LineError::TurnAlreadyServed(turn));
            }
        }
        let next_in = self.gate.current_admission()?;
        if turn > next_in {
            return Ok(Access::NotYet { turn, next_in });
        }
        let expires_at = Instant::now() + self.config.access_max_age;
        self.in_service.add(turn, expires_at)?;
        log::debug!("Line '{}': turn {} claimed access", self.id, turn);
        Ok(Access::Granted { turn, expires_at })
    }

    /// Lets the next turn in and returns the new admission value.
    ///
    /// Under `ReleasePolicy::Permissive` this always advances. Under
    /// `ReleasePolicy::Tracked` the turn must be in service and not counted
    /// before; it is taken out of service and recorded as served, so each
    /// turn advances admission at most once.
    ///
    /// If admission cannot be advanced, the turn is put back in service.
    pub fn release(&self, turn: Turn) -> Result<u64, LineError> {
        let was_in_service = self.in_service.remove(turn)?;
        if self.is_tracked() {
            if !was_in_service {
                return Err(LineError::TurnNotInService(turn));
            }
            if !self.served.mark(turn)? {
                return Err(LineError::TurnAlreadyServed(turn));
            }
        }
        let next_in = match self.gate.advance() {
            Ok(next_in) => next_in,
            Err(e) => {
                self.restore(turn, was_in_service, Instant::now() + self.config.access_max_age);
                return Err(e);
            }
        };
        log::debug!(
            "Line '{}': turn {} released, admission now {}",
            self.id,
            turn,
            next_in
        );
        Ok(next_in)
    }

    /// Takes every in-service turn whose access ran out and advances
    /// admission once for each, as if it had been released. Returns how many
    /// turns were reclaimed.
    ///
    /// If admission cannot be advanced, the turns not yet counted go back in
    /// service as already expired, so the next sweep picks them up again.
    pub fn reclaim_expired(&self) -> Result<usize, LineError> {
        let now = Instant::now();
        let expired = self.in_service.take_expired(now)?;
        let mut reclaimed = Vec::with_capacity(expired.len());
        for (done, &turn) in expired.iter().enumerate() {
            if self.is_tracked() {
                match self.served.mark(turn) {
                    // A turn released concurrently was already counted
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        for &pending in &expired[done..] {
                            self.put_back(pending, now);
                        }
                        return Err(e.into());
                    }
                }
            }
            if let Err(e) = self.gate.advance() {
                self.restore(turn, true, now);
                for &pending in &expired[done + 1..] {
                    self.put_back(pending, now);
                }
                return Err(e);
            }
            reclaimed.push(turn);
        }
        if !reclaimed.is_empty() {
            log::info!(
                "Line '{}': reclaimed {} expired access(es): {:?}",
                self.id,
                reclaimed.len(),
                reclaimed
            );
        }
        Ok(reclaimed.len())
    }

    // Undoes the bookkeeping of a turn whose admission step failed.
    fn restore(&self, turn: Turn, was_in_service: bool, expires_at: Instant) {
        if self.is_tracked() {
            if let Err(e) = self.served.unmark(turn) {
                log::error!("Line '{}': cannot unmark turn {}: {}", self.id, turn, e);
            }
        }
        if was_in_service {
            self.put_back(turn, expires_at);
        }
    }

    fn put_back(&self, turn: Turn, expires_at: Instant) {
        if let Err(e) = self.in_service.add(turn, expires_at) {
            log::error!("Line '{}': cannot put turn {} back in service: {}", self.id, turn, e);
        }
    }

    fn is_tracked(&self) -> bool {
        self.config.release_policy == ReleasePolicy::Tracked
    }

    /// Adds a connection to the live admission feed. It lands in the current
    /// pool, or in a new pool (with a new broadcaster) if the current one is
    /// full.
    pub fn subscribe(&self, conn: Arc<dyn SendCapable>) -> SubscriberId {
        let id = SubscriberId::next();
        let (pool, created) = self.pools.append_subscriber(Member::new(id, conn));
        if created {
            log::info!(
                "Line '{}': pool {} opened for subscriber {}",
                self.id,
                pool.index(),
                id
            );
            self.spawn_broadcaster(pool);
        }
        id
    }

    /// Snapshot of the pool sequence, in creation order.
    pub fn pools(&self) -> Vec<Arc<SubscriberPool>> {
        self.pools.pools()
    }

    /// Counters and sizes, read independently.
    pub fn status(&self) -> Result<LineStatus, LineError> {
        let pools = self.pools();
        Ok(LineStatus {
            resource: self.id.to_string(),
            next_turn: self.tickets.last_issued()?,
            next_in: self.gate.current_admission()?,
            capacity: self.config.capacity,
            pools: pools.len(),
            subscribers: pools.iter().map(|p| p.len()).sum(),
            in_service: self.in_service.len()?,
        })
    }

    /// Stops every broadcaster of this line. Counters stay readable.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Line '{}' shutting down its broadcasters", self.id);
            self.cancel.cancel();
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the line is shut down or evicted.
    pub async fn shut_down(&self) {
        self.cancel.cancelled().await
    }

    /// Resource id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribers per pool.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// How long a claimed access lasts.
    pub fn access_max_age(&self) -> Duration {
        self.config.access_max_age
    }

    /// How long an issued turn is advertised as valid.
    pub fn waiting_max_age(&self) -> Duration {
        self.config.waiting_max_age
    }

    /// The full configuration.
    pub fn config(&self) -> &LineConfig {
        &self.config
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscriber::ChannelSubscriber;
    use crate::error::StoreError;
    use crate::stores::{CounterStore, MemoryCounterStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(capacity: usize) -> LineConfig {
        LineConfig {
            capacity,
            ..Default::default()
        }
    }

    fn tracked(config: LineConfig) -> LineConfig {
        LineConfig {
            release_policy: ReleasePolicy::Tracked,
            ..config
        }
    }

    // Counters whose admission key can be switched to fail
    #[derive(Default)]
    struct FlakyCounters {
        inner: MemoryCounterStore,
        fail_advance: AtomicBool,
    }

    impl CounterStore for FlakyCounters {
        fn init(&self, key: &str, value: u64) -> Result<u64, StoreError> {
            self.inner.init(key, value)
        }

        fn increment(&self, key: &str) -> Result<u64, StoreError> {
            if key.ends_with(":in") && self.fail_advance.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("store down".to_string()));
            }
            self.inner.increment(key)
        }

        fn get(&self, key: &str) -> Result<u64, StoreError> {
            self.inner.get(key)
        }
    }

    #[derive(Default)]
    struct FlakyBackend {
        counters: Arc<FlakyCounters>,
        memory: MemoryBackend,
    }

    impl LineBackend for FlakyBackend {
        fn counters(&self) -> Arc<dyn CounterStore> {
            self.counters.clone()
        }

        fn in_service_set(&self, line_id: &str) -> Arc<dyn ExpiringSet> {
            self.memory.in_service_set(line_id)
        }

        fn served_turns(&self, line_id: &str) -> Arc<dyn ServedTurns> {
            self.memory.served_turns(line_id)
        }
    }

    #[tokio::test]
    async fn test_sequential_turns_have_no_gaps() {
        let line = Line::in_memory("r1", config(10)).unwrap();
        let turns: Vec<Turn> = (0..100).map(|_| line.issue_turn().unwrap()).collect();
        assert_eq!(turns, (1..=100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_release_advances_admission_by_one() {
        let line = Line::in_memory("r1", config(10)).unwrap();
        assert_eq!(line.current_admission().unwrap(), 1);
        for k in 1..=5 {
            assert_eq!(line.release(k).unwrap(), 1 + k);
        }
        assert_eq!(line.current_admission().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_initial_admission_is_configurable() {
        let line = Line::in_memory(
            "r1",
            LineConfig {
                initial_admission: 4,
                ..config(4)
            },
        )
        .unwrap();
        assert!(line.is_admitted(4).unwrap());
        assert!(!line.is_admitted(5).unwrap());
    }

    #[tokio::test]
    async fn test_is_admitted_matches_comparison() {
        let line = Line::in_memory("r1", config(10)).unwrap();
        for _ in 0..3 {
            let admission = line.current_admission().unwrap();
            for turn in 1..10 {
                assert_eq!(line.is_admitted(turn).unwrap(), turn <= admission);
            }
            line.release(admission).unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            Line::in_memory("r1", config(0)),
            Err(LineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_access_grants_only_admitted_turns() {
        let line = Line::in_memory("r1", config(10)).unwrap();
        let first = line.issue_turn().unwrap();
        let second = line.issue_turn().unwrap();

        assert!(matches!(
            line.claim_access(first).unwrap(),
            Access::Granted { turn: 1, .. }
        ));
        assert_eq!(
            line.claim_access(second).unwrap(),
            Access::NotYet { turn: 2, next_in: 1 }
        );
        assert_eq!(line.status().unwrap().in_service, 1);
    }

    #[tokio::test]
    async fn test_tracked_release_requires_service_and_rejects_repeats() {
        let line = Line::in_memory(
            "r1",
            LineConfig {
                release_policy: ReleasePolicy::Tracked,
                ..config(10)
            },
        )
        .unwrap();
        let turn = line.issue_turn().unwrap();

        assert_eq!(line.release(turn), Err(LineError::TurnNotInService(turn)));
        assert_eq!(line.current_admission().unwrap(), 1);

        line.claim_access(turn).unwrap();
        assert_eq!(line.release(turn).unwrap(), 2);
        assert_eq!(line.release(turn), Err(LineError::TurnNotInService(turn)));
        assert_eq!(line.current_admission().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tracked_claim_refuses_unissued_and_served_turns() {
        let line = Line::in_memory("r1", tracked(config(10))).unwrap();
        assert_eq!(line.claim_access(1), Err(LineError::TurnNotIssued(1)));

        let turn = line.issue_turn().unwrap();
        let mut admissions = Vec::new();
        for _ in 0..5 {
            if line.claim_access(turn).is_ok() {
                admissions.push(line.release(turn).unwrap());
            }
        }
        assert_eq!(admissions, vec![2]);
        assert_eq!(line.claim_access(turn), Err(LineError::TurnAlreadyServed(turn)));
        assert_eq!(line.current_admission().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_reclaimed_turn_cannot_come_back() {
        let line = Line::in_memory(
            "r1",
            tracked(LineConfig {
                access_max_age: Duration::from_secs(10),
                ..config(10)
            }),
        )
        .unwrap();
        let turn = line.issue_turn().unwrap();
        line.claim_access(turn).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(line.reclaim_expired().unwrap(), 1);
        assert_eq!(line.claim_access(turn), Err(LineError::TurnAlreadyServed(turn)));
        assert_eq!(line.release(turn), Err(LineError::TurnNotInService(turn)));
        assert_eq!(line.current_admission().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_release_keeps_turn_in_service() {
        let backend = FlakyBackend::default();
        let line = Line::new("r1", tracked(config(10)), &backend).unwrap();
        let turn = line.issue_turn().unwrap();
        line.claim_access(turn).unwrap();

        backend.counters.fail_advance.store(true, Ordering::SeqCst);
        assert!(matches!(line.release(turn), Err(LineError::Store(_))));
        assert_eq!(line.status().unwrap().in_service, 1);
        assert_eq!(line.current_admission().unwrap(), 1);

        backend.counters.fail_advance.store(false, Ordering::SeqCst);
        assert_eq!(line.release(turn).unwrap(), 2);
        assert_eq!(line.status().unwrap().in_service, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reclaim_is_retried_on_next_sweep() {
        let backend = FlakyBackend::default();
        let line = Line::new(
            "r1",
            LineConfig {
                access_max_age: Duration::from_secs(10),
                initial_admission: 2,
                ..config(10)
            },
            &backend,
        )
        .unwrap();
        for _ in 0..2 {
            line.claim_access(line.issue_turn().unwrap()).unwrap();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        backend.counters.fail_advance.store(true, Ordering::SeqCst);
        assert!(line.reclaim_expired().is_err());
        assert_eq!(line.status().unwrap().in_service, 2);

        backend.counters.fail_advance.store(false, Ordering::SeqCst);
        assert_eq!(line.reclaim_expired().unwrap(), 2);
        assert_eq!(line.current_admission().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_permissive_release_accepts_any_turn() {
        let line = Line::in_memory("r1", config(10)).unwrap();
        assert_eq!(line.release(999).unwrap(), 2);
        assert_eq!(line.release(999).unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_access_is_reclaimed_once() {
        let line = Line::in_memory(
            "r1",
            LineConfig {
                access_max_age: Duration::from_secs(60),
                ..config(10)
            },
        )
        .unwrap();
        line.claim_access(line.issue_turn().unwrap()).unwrap();

        assert_eq!(line.reclaim_expired().unwrap(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(line.reclaim_expired().unwrap(), 1);
        assert_eq!(line.current_admission().unwrap(), 2);
        assert_eq!(line.reclaim_expired().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_shards_into_pools() {
        let line = Line::in_memory("r1", config(3)).unwrap();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (subscriber, rx) = ChannelSubscriber::new(8);
            line.subscribe(Arc::new(subscriber));
            receivers.push(rx);
        }
        let pools = line.pools();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].len(), 3);
        assert!(pools[0].is_full());
        assert_eq!(pools[1].len(), 1);
    }

    #[tokio::test]
    async fn test_accessors_expose_config() {
        let line = Line::in_memory(
            "queue-a",
            LineConfig {
                access_max_age: Duration::from_secs(30),
                waiting_max_age: Duration::from_secs(90),
                ..config(5)
            },
        )
        .unwrap();
        assert_eq!(line.id(), "queue-a");
        assert_eq!(line.capacity(), 5);
        assert_eq!(line.access_max_age(), Duration::from_secs(30));
        assert_eq!(line.waiting_max_age(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let line = Line::in_memory("r1", config(2)).unwrap();
        assert!(!line.is_shut_down());
        line.shutdown();
        line.shutdown();
        assert!(line.is_shut_down());
        assert_eq!(line.issue_turn().unwrap(), 1);
    }

    #[test]
    fn test_release_policy_parses_case_insensitively() {
        assert_eq!("Tracked".parse::<ReleasePolicy>().unwrap(), ReleasePolicy::Tracked);
        assert_eq!(
            " permissive ".parse::<ReleasePolicy>().unwrap(),
            ReleasePolicy::Permissive
        );
        assert!("strict".parse::<ReleasePolicy>().is_err());
    }

    #[test]
    fn test_line_config_deserializes_with_defaults() {
        let config: LineConfig =
            serde_json::from_str(r#"{"capacity": 2, "release_policy": "tracked"}"#).unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.release_policy, ReleasePolicy::Tracked);
        assert_eq!(config.initial_admission, 1);
    }
}
