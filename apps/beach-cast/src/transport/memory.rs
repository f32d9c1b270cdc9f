use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{Transport, TransportError, TransportEvent, TransportLink};
use crate::protocol::Message;

/// In-process transport; each `open` hands the relay side to the test as a [`MemoryPeer`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    peers: Arc<Mutex<VecDeque<MemoryPeer>>>,
    opened: Arc<Mutex<Vec<Url>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest connection attempt not yet claimed by the test.
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().pop_front()
    }

    /// Every url passed to `open`, in order.
    pub fn opened_urls(&self) -> Vec<Url> {
        self.opened.lock().clone()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, url: &Url) -> TransportLink {
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        self.opened.lock().push(url.clone());
        self.peers.lock().push_back(MemoryPeer {
            url: url.clone(),
            events: tx_events,
            frames: Some(rx_out),
        });
        TransportLink {
            outgoing: tx_out,
            events: rx_events,
        }
    }
}

/// Relay end of one memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemoryPeer {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.events.send(TransportEvent::Closed {
            reason: reason.map(str::to_owned),
        });
    }

    pub fn fail(&self, message: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error(TransportError::WebSocket(message.to_owned())));
    }

    pub fn deliver(&self, message: &Message) {
        if let Ok(bytes) = message.encode() {
            let _ = self.events.send(TransportEvent::Message(bytes));
        }
    }

    pub fn deliver_raw(&self, bytes: Bytes) {
        let _ = self.events.send(TransportEvent::Message(bytes));
    }

    /// Stops accepting writes; later sends on the link fail.
    pub fn hang_up(&mut self) {
        self.frames = None;
    }

    /// Encoded frames written so far that have not been taken yet.
    pub fn take_frames(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(rx) = self.frames.as_mut() {
            while let Ok(frame) = rx.try_recv() {
                out.push(frame);
            }
        }
        out
    }

    /// Like [`Self::take_frames`] but decoded; undecodable frames are skipped.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.take_frames()
            .into_iter()
            .filter_map(|frame| Message::decode(frame).ok())
            .collect()
    }
}
