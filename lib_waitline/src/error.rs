//! # Error Types
//!
//! Failures that can cross the library boundary. Broadcast send failures are
//! deliberately absent: they are logged and counted by the broadcaster and
//! never reach a caller.

use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Incrementing the counter would wrap around; the value is left untouched
    /// so no turn is ever issued twice.
    #[error("Counter '{0}' would overflow")]
    Overflow(String),

    /// The backing store could not be reached or answered with garbage.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by `Line` operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineError {
    /// The underlying store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Raised under `ReleasePolicy::Tracked` when the released turn is not
    /// currently holding access.
    #[error("Turn {0} is not in service")]
    TurnNotInService(u64),

    /// Raised under `ReleasePolicy::Tracked` when access is claimed for a
    /// turn the line has not issued yet.
    #[error("Turn {0} has not been issued")]
    TurnNotIssued(u64),

    /// Raised under `ReleasePolicy::Tracked` when access is claimed for a
    /// turn that was already released or reclaimed.
    #[error("Turn {0} was already served")]
    TurnAlreadyServed(u64),

    /// A turn supplied from outside the process could not be parsed.
    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    /// A `LineConfig` value is out of range.
    #[error("Invalid line configuration: {0}")]
    InvalidConfig(String),
}
