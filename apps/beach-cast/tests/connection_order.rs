use std::sync::Arc;

use beach_cast::config::BroadcastConfig;
use beach_cast::connection::{ConnectionManager, FrameSink};
use beach_cast::protocol::{Message, TerminalResize};
use beach_cast::transport::{MemoryPeer, MemoryTransport, TransportEvent};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Send,
    Open,
    Drop,
    HangUp,
    Reconnect,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Send),
        2 => Just(Step::Open),
        1 => Just(Step::Drop),
        1 => Just(Step::HangUp),
        1 => Just(Step::Reconnect),
    ]
}

fn frame(n: u32) -> Message {
    Message::TerminalResize(TerminalResize {
        terminal_id: n,
        cols: 80,
        rows: 24,
    })
}

/// Relay side of every link the manager opened, read in the order links were created.
struct Relay {
    transport: MemoryTransport,
    peers: Vec<MemoryPeer>,
    received: Vec<u32>,
}

impl Relay {
    fn collect(&mut self) {
        while let Some(peer) = self.transport.take_peer() {
            self.peers.push(peer);
        }
        for peer in &mut self.peers {
            for message in peer.take_messages() {
                if let Message::TerminalResize(resize) = message {
                    self.received.push(resize.terminal_id);
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn frames_arrive_once_and_in_order(steps in prop::collection::vec(step(), 1..64)) {
        let transport = MemoryTransport::new();
        let config = BroadcastConfig::new("ws://127.0.0.1:9000", "room-1").unwrap();
        let mut manager = ConnectionManager::connect(config, Arc::new(transport.clone()));
        let mut relay = Relay { transport, peers: Vec::new(), received: Vec::new() };
        let mut sent = 0u32;

        for step in steps {
            match step {
                Step::Send => {
                    manager.send(frame(sent));
                    sent += 1;
                }
                Step::Open => {
                    manager.handle_event(TransportEvent::Open);
                }
                Step::Drop => {
                    manager.handle_event(TransportEvent::Closed { reason: None });
                }
                Step::HangUp => {
                    relay.collect();
                    if let Some(peer) = relay.peers.last_mut() {
                        peer.hang_up();
                    }
                }
                Step::Reconnect => manager.reconnect(None),
            }
            relay.collect();
        }

        manager.reconnect(None);
        manager.handle_event(TransportEvent::Open);
        relay.collect();

        prop_assert_eq!(relay.received, (0..sent).collect::<Vec<_>>());
        prop_assert_eq!(manager.queue_stats().frames, 0);
    }
}
