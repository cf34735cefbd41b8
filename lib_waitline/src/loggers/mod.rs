//! # Loggers
//!
//! Logging setup for binaries built on this crate. The library itself only
//! emits records through the `log` facade.

/// stdout + rotating file logger built on `fern`.
pub mod loggerlocal;

pub use loggerlocal::{level_from_str, setup_logging};
