use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod memory;
pub mod queue;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use queue::{OutboundQueue, QueueStats};
pub use websocket::WebSocketTransport;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("transport closed")]
    Closed,
}

/// Lifecycle and inbound traffic reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Bytes),
    /// Frames accepted on `outgoing` that never reached the wire, oldest first. Sent before `Closed`.
    Unsent(Vec<Bytes>),
    Error(TransportError),
    Closed { reason: Option<String> },
}

/// Both halves of one transport attempt.
///
/// `outgoing` accepts encoded frames at any time; they are only meaningful once [`TransportEvent::Open`]
/// has been observed on `events`. Acceptance is not delivery: frames still buffered when the transport
/// dies come back in one [`TransportEvent::Unsent`], and sends after that fail and return the frame.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<Bytes>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to the relay.
pub trait Transport: Send + Sync {
    /// Starts connecting in the background and returns immediately.
    fn open(&self, url: &Url) -> TransportLink;
}
