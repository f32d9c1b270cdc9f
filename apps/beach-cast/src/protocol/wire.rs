use bytes::{BufMut, Bytes, BytesMut};

use super::messages::{DocumentUpdate, OutputStream, TerminalOutput};
use super::{Channel, PROTOCOL_VERSION};

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const CHANNEL_MASK: u8 = 0b0001_1111;

/// Bytes occupied by the frame header: `[version|channel, kind]`.
pub const HEADER_LEN: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown channel: {0}")]
    UnknownChannel(u8),
    #[error("unknown frame type {kind:#04x} on channel {channel:?}")]
    UnknownFrameType { channel: Channel, kind: u8 },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    #[error("json payload: {0}")]
    Json(String),
}

/// Routing information available without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub channel: Channel,
    pub kind: u8,
}

pub fn write_header(buf: &mut BytesMut, channel: Channel, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.put_u8((version << 5) | (channel.as_u8() & CHANNEL_MASK));
    buf.put_u8(kind);
}

/// Reads only the two header bytes; the payload is left untouched.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::UnexpectedEof);
    }
    let version = (bytes[0] & VERSION_MASK) >> 5;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    let raw_channel = bytes[0] & CHANNEL_MASK;
    let channel = Channel::from_u8(raw_channel).ok_or(WireError::UnknownChannel(raw_channel))?;
    Ok(FrameHeader {
        version,
        channel,
        kind: bytes[1],
    })
}

pub(crate) fn encode_terminal_output(output: &TerminalOutput) -> Bytes {
    let mut buf = Vec::with_capacity(16 + output.data.len());
    write_var_u32(&mut buf, output.terminal_id);
    // Exec ids start at 1, so 0 marks output outside any tracked execution.
    write_var_u32(&mut buf, output.exec_id.unwrap_or(0));
    write_var_u32(&mut buf, output.seq);
    buf.push(output.stream.as_u8());
    buf.extend_from_slice(&output.data);
    Bytes::from(buf)
}

pub(crate) fn decode_terminal_output(payload: &Bytes) -> Result<TerminalOutput, WireError> {
    let mut cursor = Cursor::new(payload);
    let terminal_id = cursor.read_var_u32()?;
    let exec_id = match cursor.read_var_u32()? {
        0 => None,
        id => Some(id),
    };
    let seq = cursor.read_var_u32()?;
    let stream = OutputStream::from_u8(cursor.read_u8()?)
        .ok_or(WireError::InvalidData("unknown output stream"))?;
    let data = payload.slice(cursor.pos..);
    Ok(TerminalOutput {
        terminal_id,
        exec_id,
        seq,
        stream,
        data,
    })
}

pub(crate) fn encode_document_update(update: &DocumentUpdate) -> Bytes {
    let id = update.file_id.as_bytes();
    let mut buf = Vec::with_capacity(8 + id.len() + update.update.len());
    write_var_u32(&mut buf, id.len() as u32);
    buf.extend_from_slice(id);
    buf.extend_from_slice(&update.update);
    Bytes::from(buf)
}

pub(crate) fn decode_document_update(payload: &Bytes) -> Result<DocumentUpdate, WireError> {
    let mut cursor = Cursor::new(payload);
    let len = cursor.read_var_u32()? as usize;
    let id = cursor.read_bytes(len)?;
    let file_id = std::str::from_utf8(id)
        .map_err(|_| WireError::InvalidData("file id is not utf-8"))?
        .to_owned();
    Ok(DocumentUpdate {
        file_id,
        update: payload.slice(cursor.pos..),
    })
}

fn write_var_u32(buf: &mut Vec<u8>, value: u32) {
    write_var_u64(buf, value as u64);
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        if value > u32::MAX as u64 {
            return Err(WireError::InvalidData("u32 overflow"));
        }
        Ok(value as u32)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
