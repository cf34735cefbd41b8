//! # Subscriber Capability
//!
//! The engine knows nothing about sockets. A subscriber is anything that can
//! accept one message per push; framing, handshakes and transport identity
//! belong to whoever implements [`SendCapable`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A live connection that can receive pushed messages.
#[async_trait]
pub trait SendCapable: Send + Sync {
    /// Delivers one message. An error marks this push as failed for this
    /// subscriber only.
    async fn send(&self, message: Bytes) -> io::Result<()>;
}

/// Process-unique handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # Channel Subscriber
///
/// A [`SendCapable`] backed by a bounded MPSC channel. The receiving half is
/// owned by a writer task that forwards messages to the real connection.
///
/// - When the writer task ends (socket closed), the receiver is dropped and
///   every later `send` fails with `BrokenPipe`.
/// - When the writer stops draining, the channel fills up and `send` waits;
///   the broadcaster's send timeout turns that into a failure.
#[derive(Clone)]
pub struct ChannelSubscriber {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the receiver its writer task should drain.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SendCapable for ChannelSubscriber {
    async fn send(&self, message: Bytes) -> io::Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "subscriber channel closed"))
    }
}
