use lib_waitline::LineRegistry;
use std::sync::Arc;

/// Messages buffered per WebSocket before pushes start waiting on it.
pub const DEFAULT_WS_BUFFER: usize = 8;

#[derive(Clone)]
pub struct AppState {
    // The one registry of this process, resolved per request
    pub registry: Arc<LineRegistry>,
    // Outbox size of each WebSocket subscriber
    pub ws_buffer: usize,
}

impl AppState {
    pub fn new(registry: Arc<LineRegistry>) -> Self {
        Self {
            registry,
            ws_buffer: DEFAULT_WS_BUFFER,
        }
    }
}
