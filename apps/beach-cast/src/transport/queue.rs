use std::collections::VecDeque;

use bytes::Bytes;

/// Encoded frames waiting for a writable transport.
///
/// Unbounded for the lifetime of the process; nothing is persisted across restarts.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<Bytes>,
    bytes: usize,
    enqueued: u64,
    flushed: u64,
    requeued: u64,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub frames: usize,
    pub bytes: usize,
    pub enqueued: u64,
    pub flushed: u64,
    pub requeued: u64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            frames: self.frames.len(),
            bytes: self.bytes,
            enqueued: self.enqueued,
            flushed: self.flushed,
            requeued: self.requeued,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn push_back(&mut self, frame: Bytes) {
        self.bytes += frame.len();
        self.enqueued += 1;
        self.frames.push_back(frame);
    }

    /// Returns a frame whose write failed to the head so it goes out first next time.
    pub fn push_front(&mut self, frame: Bytes) {
        self.bytes += frame.len();
        self.requeued += 1;
        self.frames.push_front(frame);
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.len();
        self.flushed += 1;
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}
