//! Relay connection lifecycle with store-and-forward buffering.
//!
//! Frames are written immediately while the link is open and queued otherwise. Queued frames are
//! flushed in enqueue order right after the handshake of the next successful open, so a caller never
//! observes reordering across connect or reconnect boundaries.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::BroadcastConfig;
use crate::protocol::{
    BroadcasterAnnounce, Channel, FEATURES, Hello, Message, Metadata, PROTOCOL_VERSION, Welcome,
    decode_header,
};
use crate::telemetry;
use crate::transport::{QueueStats, OutboundQueue, Transport, TransportEvent, TransportLink};
use crate::transport::websocket::redacted_url;

/// Destination for outbound protocol messages.
pub trait FrameSink {
    fn send(&mut self, message: Message);
}

/// Collecting sink used by handlers under test.
impl FrameSink for Vec<Message> {
    fn send(&mut self, message: Message) {
        self.push(message);
    }
}

/// What the coordinator needs to know about a processed transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Opened,
    Closed { reason: Option<String> },
    Welcome(Welcome),
    ViewerCount(u32),
    Metadata(Metadata),
}

pub struct ConnectionManager {
    config: BroadcastConfig,
    transport: Arc<dyn Transport>,
    link: Option<TransportLink>,
    is_open: bool,
    closed: bool,
    queue: OutboundQueue,
    reconnect_token: Option<String>,
    session_id: Option<String>,
}

impl ConnectionManager {
    /// Opens the transport in the background; frames sent before it opens are queued.
    pub fn connect(config: BroadcastConfig, transport: Arc<dyn Transport>) -> Self {
        let mut manager = Self {
            config,
            transport,
            link: None,
            is_open: false,
            closed: false,
            queue: OutboundQueue::new(),
            reconnect_token: None,
            session_id: None,
        };
        manager.open_link();
        manager
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn reconnect_token(&self) -> Option<&str> {
        self.reconnect_token.as_deref()
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    fn open_link(&mut self) {
        let url = self.config.connection_url(self.reconnect_token.as_deref());
        info!(
            target: "beach_cast::connection",
            url = %redacted_url(&url),
            queued = self.queue.len(),
            "opening relay connection"
        );
        self.link = Some(self.transport.open(&url));
        self.is_open = false;
    }

    /// Replaces the transport with a fresh one, optionally with a new auth token. The queue survives.
    pub fn reconnect(&mut self, auth_token: Option<String>) {
        if self.closed {
            debug!(target: "beach_cast::connection", "reconnect ignored after close");
            return;
        }
        self.config.auth_token = auth_token.filter(|token| !token.is_empty());
        self.link = None;
        self.open_link();
    }

    /// Idempotent. Drops the transport and anything still queued; later sends are discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.is_open = false;
        self.link = None;
        let stats = self.queue.stats();
        if stats.frames > 0 {
            debug!(
                target: "beach_cast::connection",
                frames = stats.frames,
                bytes = stats.bytes,
                "discarding queued frames on close"
            );
        }
        self.queue.clear();
        info!(target: "beach_cast::connection", "relay connection closed");
    }

    /// Next lifecycle or inbound event. Pends forever while there is no transport.
    pub async fn next_event(&mut self) -> TransportEvent {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };
        match link.events.recv().await {
            Some(event) => event,
            None => {
                self.link = None;
                TransportEvent::Closed {
                    reason: Some("transport dropped".into()),
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Option<ConnectionUpdate> {
        if self.closed {
            return None;
        }
        match event {
            TransportEvent::Open => {
                self.is_open = true;
                info!(target: "beach_cast::connection", "relay connection open");
                self.send_handshake();
                self.flush();
                Some(ConnectionUpdate::Opened)
            }
            TransportEvent::Closed { reason } => {
                warn!(
                    target: "beach_cast::connection",
                    reason = reason.as_deref().unwrap_or("unknown"),
                    queued = self.queue.len(),
                    "relay connection closed by transport"
                );
                self.is_open = false;
                self.link = None;
                Some(ConnectionUpdate::Closed { reason })
            }
            TransportEvent::Error(err) => {
                warn!(target: "beach_cast::connection", error = %err, "relay transport error");
                let was_open = self.is_open;
                self.is_open = false;
                was_open.then(|| ConnectionUpdate::Closed {
                    reason: Some(err.to_string()),
                })
            }
            TransportEvent::Message(bytes) => self.handle_inbound(bytes),
            TransportEvent::Unsent(frames) => {
                self.requeue_unsent(frames);
                None
            }
        }
    }

    /// Puts frames the transport never wrote back at the head of the queue, ahead of anything
    /// queued since. Handshake frames are dropped; the next open sends fresh ones.
    fn requeue_unsent(&mut self, frames: Vec<Bytes>) {
        let mut kept = 0;
        for frame in frames.into_iter().rev() {
            if is_handshake(&frame) {
                continue;
            }
            self.queue.push_front(frame);
            kept += 1;
        }
        warn!(
            target: "beach_cast::connection",
            requeued = kept,
            queued = self.queue.len(),
            "transport returned unsent frames"
        );
        self.is_open = false;
    }

    fn handle_inbound(&mut self, bytes: Bytes) -> Option<ConnectionUpdate> {
        let header = match decode_header(&bytes) {
            Ok(header) => header,
            Err(err) => {
                warn!(target: "beach_cast::connection", error = %err, "dropping malformed inbound frame");
                trace!(target: "beach_cast::connection", frame = %telemetry::logging::hexdump(&bytes), "malformed frame bytes");
                return None;
            }
        };
        if header.channel != Channel::Control {
            trace!(
                target: "beach_cast::connection",
                channel = ?header.channel,
                kind = header.kind,
                "ignoring inbound frame"
            );
            return None;
        }
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "beach_cast::connection", error = %err, "failed to decode inbound control frame");
                return None;
            }
        };
        match message {
            Message::Welcome(welcome) => {
                if let Some(token) = welcome.reconnect_token.clone() {
                    self.reconnect_token = Some(token);
                }
                if let Some(session) = welcome.session_id.clone() {
                    self.session_id = Some(session);
                }
                debug!(
                    target: "beach_cast::connection",
                    session = ?welcome.session_id,
                    viewers = ?welcome.viewers,
                    "welcomed by relay"
                );
                Some(ConnectionUpdate::Welcome(welcome))
            }
            Message::ViewerCount(count) => Some(ConnectionUpdate::ViewerCount(count.count)),
            Message::UpdateMetadata(metadata) => Some(ConnectionUpdate::Metadata(metadata)),
            other => {
                trace!(target: "beach_cast::connection", kind = ?other.kind(), "ignoring inbound control message");
                None
            }
        }
    }

    fn send_handshake(&mut self) {
        let hello = Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            features: FEATURES.iter().map(|feature| feature.to_string()).collect(),
            client: concat!("beach-cast/", env!("CARGO_PKG_VERSION")).to_string(),
        });
        let announce = Message::BroadcasterAnnounce(BroadcasterAnnounce {
            role: self.config.role.clone(),
            room: self.config.room.clone(),
        });
        for message in [hello, announce] {
            // Handshake frames belong to this link only; a later open produces its own.
            if let Some(bytes) = encode(&message)
                && self.write(bytes).is_err()
            {
                self.mark_broken();
                return;
            }
        }
    }

    fn flush(&mut self) {
        while self.is_open {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            if let Err(frame) = self.write(frame) {
                self.queue.push_front(frame);
                self.mark_broken();
            }
        }
    }

    fn write(&mut self, bytes: Bytes) -> Result<(), Bytes> {
        let Some(link) = self.link.as_ref() else {
            return Err(bytes);
        };
        let len = bytes.len();
        link.outgoing.send(bytes).map_err(|err| err.0)?;
        telemetry::record_bytes("connection_write", len);
        Ok(())
    }

    fn mark_broken(&mut self) {
        warn!(
            target: "beach_cast::connection",
            queued = self.queue.len(),
            "relay link stopped accepting writes"
        );
        self.is_open = false;
    }
}

impl FrameSink for ConnectionManager {
    fn send(&mut self, message: Message) {
        if self.closed {
            trace!(target: "beach_cast::connection", kind = ?message.kind(), "discarding frame after close");
            return;
        }
        let Some(bytes) = encode(&message) else {
            return;
        };
        if self.is_open && self.queue.is_empty() {
            if let Err(bytes) = self.write(bytes) {
                self.queue.push_back(bytes);
                self.mark_broken();
            }
        } else {
            self.queue.push_back(bytes);
            self.flush();
        }
    }
}

fn is_handshake(frame: &Bytes) -> bool {
    matches!(
        Message::decode(frame.clone()),
        Ok(Message::Hello(_) | Message::BroadcasterAnnounce(_))
    )
}

fn encode(message: &Message) -> Option<Bytes> {
    match message.encode() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(target: "beach_cast::connection", kind = ?message.kind(), error = %err, "failed to encode frame");
            None
        }
    }
}
