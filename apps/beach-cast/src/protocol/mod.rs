//! Broadcast wire protocol: a two-byte header (version + channel, message type) followed by a payload.

pub mod messages;
pub mod wire;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use messages::*;
pub use wire::{FrameHeader, HEADER_LEN, WireError, decode_header};

pub const PROTOCOL_VERSION: u8 = 1;

/// Features advertised in the HELLO handshake.
pub const FEATURES: &[&str] = &[
    "crdt-text",
    "cursor",
    "highlights",
    "terminal-exec",
    "terminal-snapshot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Code,
}

impl Channel {
    pub fn as_u8(self) -> u8 {
        match self {
            Channel::Control => 0,
            Channel::Code => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Channel::Control),
            1 => Some(Channel::Code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    BroadcasterAnnounce,
    FileInfo,
    Cursor,
    Highlights,
    UpdateMetadata,
    GoLive,
    Welcome,
    ViewerCount,
    TerminalOpen,
    TerminalClose,
    TerminalState,
    TerminalResize,
    TerminalTitle,
    ExecStart,
    ExecEnd,
    TerminalOutput,
    TerminalSnapshot,
    DocumentSnapshot,
    DocumentDelta,
}

const CONTROL_KINDS: &[(MessageKind, u8)] = &[
    (MessageKind::Hello, 0x01),
    (MessageKind::BroadcasterAnnounce, 0x02),
    (MessageKind::FileInfo, 0x03),
    (MessageKind::Cursor, 0x04),
    (MessageKind::Highlights, 0x05),
    (MessageKind::UpdateMetadata, 0x06),
    (MessageKind::GoLive, 0x07),
    (MessageKind::Welcome, 0x10),
    (MessageKind::ViewerCount, 0x11),
    (MessageKind::TerminalOpen, 0x20),
    (MessageKind::TerminalClose, 0x21),
    (MessageKind::TerminalState, 0x22),
    (MessageKind::TerminalResize, 0x23),
    (MessageKind::TerminalTitle, 0x24),
    (MessageKind::ExecStart, 0x25),
    (MessageKind::ExecEnd, 0x26),
    (MessageKind::TerminalOutput, 0x27),
    (MessageKind::TerminalSnapshot, 0x28),
];

const CODE_KINDS: &[(MessageKind, u8)] = &[
    (MessageKind::DocumentSnapshot, 0x01),
    (MessageKind::DocumentDelta, 0x02),
];

impl MessageKind {
    pub fn channel(self) -> Channel {
        match self {
            MessageKind::DocumentSnapshot | MessageKind::DocumentDelta => Channel::Code,
            _ => Channel::Control,
        }
    }

    pub fn code(self) -> u8 {
        let table = match self.channel() {
            Channel::Control => CONTROL_KINDS,
            Channel::Code => CODE_KINDS,
        };
        table
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, code)| *code)
            .unwrap_or_default()
    }

    pub fn from_parts(channel: Channel, code: u8) -> Option<Self> {
        let table = match channel {
            Channel::Control => CONTROL_KINDS,
            Channel::Code => CODE_KINDS,
        };
        table
            .iter()
            .find(|(_, candidate)| *candidate == code)
            .map(|(kind, _)| *kind)
    }
}

/// One protocol message unit as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn channel(&self) -> Channel {
        self.kind.channel()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        wire::write_header(&mut buf, self.kind.channel(), self.kind.code());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        let header = decode_header(&bytes)?;
        let kind = MessageKind::from_parts(header.channel, header.kind).ok_or(
            WireError::UnknownFrameType {
                channel: header.channel,
                kind: header.kind,
            },
        )?;
        Ok(Self {
            kind,
            payload: bytes.slice(HEADER_LEN..),
        })
    }
}

/// Typed view over every frame this client produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    BroadcasterAnnounce(BroadcasterAnnounce),
    FileInfo(FileInfo),
    Cursor(CursorUpdate),
    Highlights(HighlightsUpdate),
    UpdateMetadata(Metadata),
    GoLive(GoLive),
    Welcome(Welcome),
    ViewerCount(ViewerCount),
    TerminalOpen(TerminalOpen),
    TerminalClose(TerminalClose),
    TerminalState(TerminalState),
    TerminalResize(TerminalResize),
    TerminalTitle(TerminalTitle),
    ExecStart(ExecStart),
    ExecEnd(ExecEnd),
    TerminalOutput(TerminalOutput),
    TerminalSnapshot(TerminalSnapshot),
    DocumentSnapshot(DocumentUpdate),
    DocumentDelta(DocumentUpdate),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::BroadcasterAnnounce(_) => MessageKind::BroadcasterAnnounce,
            Message::FileInfo(_) => MessageKind::FileInfo,
            Message::Cursor(_) => MessageKind::Cursor,
            Message::Highlights(_) => MessageKind::Highlights,
            Message::UpdateMetadata(_) => MessageKind::UpdateMetadata,
            Message::GoLive(_) => MessageKind::GoLive,
            Message::Welcome(_) => MessageKind::Welcome,
            Message::ViewerCount(_) => MessageKind::ViewerCount,
            Message::TerminalOpen(_) => MessageKind::TerminalOpen,
            Message::TerminalClose(_) => MessageKind::TerminalClose,
            Message::TerminalState(_) => MessageKind::TerminalState,
            Message::TerminalResize(_) => MessageKind::TerminalResize,
            Message::TerminalTitle(_) => MessageKind::TerminalTitle,
            Message::ExecStart(_) => MessageKind::ExecStart,
            Message::ExecEnd(_) => MessageKind::ExecEnd,
            Message::TerminalOutput(_) => MessageKind::TerminalOutput,
            Message::TerminalSnapshot(_) => MessageKind::TerminalSnapshot,
            Message::DocumentSnapshot(_) => MessageKind::DocumentSnapshot,
            Message::DocumentDelta(_) => MessageKind::DocumentDelta,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        let payload = match self {
            Message::Hello(body) => json(body)?,
            Message::BroadcasterAnnounce(body) => json(body)?,
            Message::FileInfo(body) => json(body)?,
            Message::Cursor(body) => json(body)?,
            Message::Highlights(body) => json(body)?,
            Message::UpdateMetadata(body) => json(body)?,
            Message::GoLive(body) => json(body)?,
            Message::Welcome(body) => json(body)?,
            Message::ViewerCount(body) => json(body)?,
            Message::TerminalOpen(body) => json(body)?,
            Message::TerminalClose(body) => json(body)?,
            Message::TerminalState(body) => json(body)?,
            Message::TerminalResize(body) => json(body)?,
            Message::TerminalTitle(body) => json(body)?,
            Message::ExecStart(body) => json(body)?,
            Message::ExecEnd(body) => json(body)?,
            Message::TerminalSnapshot(body) => json(body)?,
            Message::TerminalOutput(output) => wire::encode_terminal_output(output),
            Message::DocumentSnapshot(update) | Message::DocumentDelta(update) => {
                wire::encode_document_update(update)
            }
        };
        Ok(Frame {
            kind: self.kind(),
            payload,
        })
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        let payload = &frame.payload;
        Ok(match frame.kind {
            MessageKind::Hello => Message::Hello(parse(payload)?),
            MessageKind::BroadcasterAnnounce => Message::BroadcasterAnnounce(parse(payload)?),
            MessageKind::FileInfo => Message::FileInfo(parse(payload)?),
            MessageKind::Cursor => Message::Cursor(parse(payload)?),
            MessageKind::Highlights => Message::Highlights(parse(payload)?),
            MessageKind::UpdateMetadata => Message::UpdateMetadata(parse(payload)?),
            MessageKind::GoLive => Message::GoLive(parse(payload)?),
            MessageKind::Welcome => Message::Welcome(parse(payload)?),
            MessageKind::ViewerCount => Message::ViewerCount(parse(payload)?),
            MessageKind::TerminalOpen => Message::TerminalOpen(parse(payload)?),
            MessageKind::TerminalClose => Message::TerminalClose(parse(payload)?),
            MessageKind::TerminalState => Message::TerminalState(parse(payload)?),
            MessageKind::TerminalResize => Message::TerminalResize(parse(payload)?),
            MessageKind::TerminalTitle => Message::TerminalTitle(parse(payload)?),
            MessageKind::ExecStart => Message::ExecStart(parse(payload)?),
            MessageKind::ExecEnd => Message::ExecEnd(parse(payload)?),
            MessageKind::TerminalSnapshot => Message::TerminalSnapshot(parse(payload)?),
            MessageKind::TerminalOutput => {
                Message::TerminalOutput(wire::decode_terminal_output(payload)?)
            }
            MessageKind::DocumentSnapshot => {
                Message::DocumentSnapshot(wire::decode_document_update(payload)?)
            }
            MessageKind::DocumentDelta => {
                Message::DocumentDelta(wire::decode_document_update(payload)?)
            }
        })
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(self.to_frame()?.encode())
    }

    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        Self::from_frame(&Frame::decode(bytes)?)
    }
}

fn json<T: Serialize>(body: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|err| WireError::Json(err.to_string()))
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(|err| WireError::Json(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn kind_codes_are_unique_per_channel() {
        for table in [CONTROL_KINDS, CODE_KINDS] {
            for (index, (kind, code)) in table.iter().enumerate() {
                assert_eq!(kind.code(), *code);
                assert!(
                    table[index + 1..].iter().all(|(_, other)| other != code),
                    "duplicate code {code:#04x}"
                );
            }
        }
    }

    #[test_timeout::timeout]
    fn document_delta_routes_on_code_channel() {
        let message = Message::DocumentDelta(DocumentUpdate {
            file_id: "f00d".into(),
            update: Bytes::from_static(&[0, 1, 2, 250]),
        });
        let bytes = message.encode().expect("encode");
        let header = decode_header(&bytes).expect("header");
        assert_eq!(header.channel, Channel::Code);
        assert_eq!(
            MessageKind::from_parts(header.channel, header.kind),
            Some(MessageKind::DocumentDelta)
        );
        assert_eq!(Message::decode(bytes).expect("decode"), message);
    }

    #[test_timeout::timeout]
    fn control_payloads_are_camel_case_json() {
        let frame = Message::ExecEnd(ExecEnd {
            terminal_id: 3,
            exec_id: 1,
            exit_code: None,
            timestamp_ms: 42,
        })
        .to_frame()
        .expect("frame");
        let value: serde_json::Value = serde_json::from_slice(&frame.payload).expect("json");
        assert_eq!(value["terminalId"], 3);
        assert_eq!(value["execId"], 1);
        assert!(value["exitCode"].is_null());
    }

    #[test_timeout::timeout]
    fn unknown_kind_on_known_channel_is_an_error() {
        let bytes = Bytes::from(vec![PROTOCOL_VERSION << 5, 0x7f]);
        assert_eq!(
            Frame::decode(bytes),
            Err(WireError::UnknownFrameType {
                channel: Channel::Control,
                kind: 0x7f
            })
        );
    }
}
