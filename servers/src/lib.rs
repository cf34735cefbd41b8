//! HTTP and WebSocket front for the waiting room. Everything queue-related
//! lives in `lib_waitline`; this crate only routes requests to it.

pub mod waitline_logic;
