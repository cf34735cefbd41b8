//! # Waiting Room Test Harness
//!
//! Helpers shared by the integration tests in `tests/`: an in-process HTTP
//! server on an ephemeral port, and small readers for subscriber outboxes.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use bytes::Bytes;
use lib_waitline::{LineConfig, LineRegistry};
use servers::waitline_logic::{downstream, state::AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A server bound to `127.0.0.1:<ephemeral>`, serving the full router.
pub struct TestServer {
    /// Where the server listens.
    pub addr: SocketAddr,
    /// The registry behind the routes, for asserting on server-side state.
    pub registry: Arc<LineRegistry>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Binds a listener and serves the router with `defaults` for new lines.
    pub async fn start(defaults: LineConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(LineRegistry::in_memory(defaults)?);
        let app = downstream::router(AppState::new(registry.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("test server stopped: {}", e);
            }
        });
        Ok(Self {
            addr,
            registry,
            handle,
        })
    }

    /// `http://<addr><path>`
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// `ws://<addr><path>`
    pub fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.registry.shutdown();
        self.handle.abort();
    }
}

/// Everything currently buffered in `outbox`, decoded as text.
pub fn drain_text(outbox: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut received = Vec::new();
    while let Ok(bytes) = outbox.try_recv() {
        received.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    received
}

/// The most recent buffered push, if any.
pub fn last_text(outbox: &mut mpsc::Receiver<Bytes>) -> Option<String> {
    drain_text(outbox).pop()
}
