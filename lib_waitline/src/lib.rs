//! # lib_waitline
//!
//! A per-resource virtual waiting room. Arriving clients draw sequential
//! turns from a [`core::Line`], the line tracks how far admission has
//! advanced, and subscribed connections receive the admission counter on a
//! fixed interval from one broadcaster task per subscriber pool.
//!
//! The crate is split into:
//! - **`core`**: the line state machine, its subscriber pools, broadcasters
//!   and the process-wide [`core::LineRegistry`].
//! - **`stores`**: the `CounterStore` / `ExpiringSet` / `ServedTurns` seams and their
//!   in-memory implementations.
//! - **`loggers`** (feature `loggers`): stdout + file logging setup.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod core;
pub mod error;
pub mod stores;

#[cfg(feature = "loggers")]
pub mod loggers;

pub use crate::core::{
    parse_turn, Access, Line, LineConfig, LineRegistry, ReleasePolicy, SendCapable,
    SubscriberId, SubscriberPool, Turn,
};
pub use error::{LineError, StoreError};
pub use stores::{CounterStore, ExpiringSet, LineBackend, MemoryBackend, ServedTurns};
