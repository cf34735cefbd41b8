//! # Core Waiting-Room Engine
//!
//! Everything a single contended resource needs to run a queue:
//!
//! - **`counter`**: `TicketCounter` hands out turns, `AdmissionGate` tracks
//!   the highest admitted turn. Each sits on its own counter and its own lock.
//! - **`subscriber`**: the `SendCapable` capability the engine pushes through,
//!   plus a channel-backed implementation for socket writer tasks.
//! - **`pool`**: fixed-capacity batches of subscribers. Pools shard the
//!   subscriber set so no broadcast loop ever walks an unbounded list.
//! - **`broadcaster`**: one periodic task per pool pushing the admission
//!   counter to its members, pruning members that keep failing.
//! - **`line`**: the per-resource aggregate and its public operations.
//! - **`registry`**: the resource id -> `Line` cache, built once at startup
//!   and injected where lines are resolved.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Periodic per-pool push of the admission counter.
pub mod broadcaster;
/// Turn issuance and admission tracking.
pub mod counter;
/// The per-resource aggregate.
pub mod line;
/// Bounded subscriber batches.
pub mod pool;
/// Resource id to `Line` cache.
pub mod registry;
/// The push capability consumed by broadcasters.
pub mod subscriber;

// --- Public API Re-exports ---
pub use broadcaster::BroadcastReport;
pub use counter::{parse_turn, AdmissionGate, TicketCounter, Turn};
pub use line::{Access, Line, LineConfig, LineStatus, ReleasePolicy};
pub use pool::SubscriberPool;
pub use registry::LineRegistry;
pub use subscriber::{ChannelSubscriber, SendCapable, SubscriberId};
