//! # Pool Broadcaster
//!
//! One task per pool. Every tick it reads the line's admission counter once
//! and pushes it, as decimal text, to each member of its pool.
//!
//! ## Delivery rules
//! 1. Sends are best effort and isolated: a failed or timed-out send is
//!    logged and counted against that member only. The rest of the iteration
//!    and future iterations carry on.
//! 2. Nothing is retried or acknowledged.
//! 3. A member whose consecutive failures reach `max_send_failures` is pruned
//!    from the pool.
//! 4. No lock shared with the request path is held while sending: the member
//!    list is snapshotted first, and the admission read is a single short
//!    critical section.
//!
//! ## Lifecycle
//! The task stops when its cancellation token fires (line shutdown or
//! eviction) or when its pool is sealed and every member has been pruned.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::counter::AdmissionGate;
use crate::core::pool::SubscriberPool;
use crate::core::subscriber::SubscriberId;

/// Outcome of one broadcast iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// The admission value that was pushed; `None` if it could not be read.
    pub admission: Option<u64>,
    /// Members that accepted the push.
    pub delivered: Vec<SubscriberId>,
    /// Members whose push failed or timed out.
    pub failed: Vec<SubscriberId>,
    /// Members removed from the pool after this iteration.
    pub pruned: Vec<SubscriberId>,
}

/// Periodic pusher bound to one pool.
pub(crate) struct Broadcaster {
    line_id: Arc<str>,
    pool: Arc<SubscriberPool>,
    gate: Arc<AdmissionGate>,
    period: Duration,
    send_timeout: Duration,
    max_failures: u32,
    cancel: CancellationToken,
}

impl Broadcaster {
    pub(crate) fn new(
        line_id: Arc<str>,
        pool: Arc<SubscriberPool>,
        gate: Arc<AdmissionGate>,
        period: Duration,
        send_timeout: Duration,
        max_failures: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            line_id,
            pool,
            gate,
            period,
            send_timeout,
            max_failures,
            cancel,
        }
    }

    /// Starts the loop on the current Tokio runtime.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        log::debug!(
            "Broadcaster for line '{}' pool {} started",
            self.line_id,
            self.pool.index()
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!(
                        "Broadcaster for line '{}' pool {} cancelled",
                        self.line_id,
                        self.pool.index()
                    );
                    break;
                }
                _ = ticker.tick() => {
                    if self.pool.is_drained() {
                        log::info!(
                            "Line '{}' pool {} has no members left. Stopping its broadcaster.",
                            self.line_id,
                            self.pool.index()
                        );
                        break;
                    }
                    self.broadcast_once().await;
                }
            }
        }
    }

    /// Runs one iteration: read, push to every member, settle failures.
    pub(crate) async fn broadcast_once(&self) -> BroadcastReport {
        let admission = match self.gate.current_admission() {
            Ok(admission) => admission,
            Err(e) => {
                log::warn!(
                    "Line '{}' pool {}: skipping broadcast, admission unreadable: {}",
                    self.line_id,
                    self.pool.index(),
                    e
                );
                return BroadcastReport::default();
            }
        };

        let message = Bytes::from(admission.to_string());
        let members = self.pool.snapshot();
        let mut report = BroadcastReport {
            admission: Some(admission),
            delivered: Vec::with_capacity(members.len()),
            ..Default::default()
        };

        for (id, handle) in members {
            match timeout(self.send_timeout, handle.send(message.clone())).await {
                Ok(Ok(())) => report.delivered.push(id),
                Ok(Err(e)) => {
                    log::warn!(
                        "Line '{}' pool {}: push to subscriber {} failed: {}",
                        self.line_id,
                        self.pool.index(),
                        id,
                        e
                    );
                    report.failed.push(id);
                }
                Err(_) => {
                    log::warn!(
                        "Line '{}' pool {}: push to subscriber {} timed out after {:?}",
                        self.line_id,
                        self.pool.index(),
                        id,
                        self.send_timeout
                    );
                    report.failed.push(id);
                }
            }
        }

        if !report.delivered.is_empty() || !report.failed.is_empty() {
            report.pruned =
                self.pool
                    .record_outcomes(&report.delivered, &report.failed, self.max_failures);
        }
        if !report.pruned.is_empty() {
            log::info!(
                "Line '{}' pool {}: pruned {} unresponsive subscriber(s)",
                self.line_id,
                self.pool.index(),
                report.pruned.len()
            );
        }
        report
    }
}
