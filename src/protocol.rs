//! Wire protocol: framing, command codes, and payload codecs.
//!
//! Every message is a fixed 12-byte little-endian header followed by
//! `size` payload bytes. A response echoes the request `id`; an error
//! response sets the high bit of the command and carries a single `i32`
//! code. Event notifications use their own command code and never share a
//! frame with a response. Payloads are defined little-endian regardless of
//! host byte order; strings travel as length-prefixed UTF-8.

use thiserror::Error;

use crate::error::ErrorCode;
use crate::tagbase::TagHandle;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 12;

/// High bit of the command word marks an error response.
pub const ERROR_FLAG: u32 = 0x8000_0000;

/// Default ceiling on one message's payload.
pub const MSG_SIZE_DEFAULT: u32 = 65536;

/// Command codes, stable on the wire.
pub mod cmd {
    pub const MOD_REG: u32 = 1;
    pub const MOD_UNREG: u32 = 2;
    pub const TAG_ADD: u32 = 3;
    pub const TAG_DEL: u32 = 4;
    pub const TAG_GET: u32 = 5;
    pub const TAG_LIST: u32 = 6;
    pub const TAG_READ: u32 = 7;
    pub const TAG_WRITE: u32 = 8;
    pub const TAG_MWRITE: u32 = 9;
    pub const CDT_CREATE: u32 = 10;
    pub const CDT_GET: u32 = 11;
    pub const EVENT_ADD: u32 = 12;
    pub const EVENT_DEL: u32 = 13;
    pub const EVENT_MOD: u32 = 14;
    pub const MAP_ADD: u32 = 15;
    pub const MAP_DEL: u32 = 16;
    pub const MAP_GET: u32 = 17;
    pub const GROUP_ADD: u32 = 18;
    pub const GROUP_READ: u32 = 19;
    pub const GROUP_WRITE: u32 = 20;
    pub const GROUP_DEL: u32 = 21;
    pub const OVR_ADD: u32 = 22;
    pub const OVR_DEL: u32 = 23;
    pub const OVR_SET: u32 = 24;
    pub const OVR_CLR: u32 = 25;
    pub const ATOMIC_OP: u32 = 26;
    /// Out-of-band event notification, server to client only.
    pub const EVENT_NOTIFY: u32 = 100;
}

/// Framing-level failures, distinct from wire result codes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(u32),

    #[error("malformed payload")]
    Malformed,
}

impl From<ProtocolError> for ErrorCode {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(_) => ErrorCode::MsgRecv,
            ProtocolError::TooLarge(_) => ErrorCode::TooBig,
            ProtocolError::Malformed => ErrorCode::MsgBad,
        }
    }
}

/// The fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: u32,
    pub size: u32,
    pub id: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            command: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    /// Whether this frame is an error response.
    pub fn is_error(&self) -> bool {
        self.command & ERROR_FLAG != 0
    }

    /// The command with the error flag stripped.
    pub fn base_command(&self) -> u32 {
        self.command & !ERROR_FLAG
    }
}

/// Incremental little-endian payload builder.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed UTF-8 string (u16 length).
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_u16(v.len() as u16);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn put_handle(&mut self, h: &TagHandle) -> &mut Self {
        self.put_u32(h.index)
            .put_u32(h.type_code)
            .put_u32(h.byte)
            .put_u8(h.bit)
            .put_u32(h.count)
            .put_u32(h.size)
    }
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Malformed);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.take(n)?.to_vec())
    }

    /// The rest of the payload.
    pub fn get_rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        out
    }

    pub fn get_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Malformed)
    }

    pub fn get_handle(&mut self) -> Result<TagHandle, ProtocolError> {
        Ok(TagHandle {
            index: self.get_u32()?,
            type_code: self.get_u32()?,
            byte: self.get_u32()?,
            bit: self.get_u8()?,
            count: self.get_u32()?,
            size: self.get_u32()?,
        })
    }
}

/// Build a complete response frame.
pub fn response_frame(command: u32, id: u32, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        command,
        size: payload.len() as u32,
        id,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

/// Build an error response frame carrying one wire code.
pub fn error_frame(command: u32, id: u32, code: ErrorCode) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_i32(code.code());
    response_frame(command | ERROR_FLAG, id, &w.into_bytes())
}

/// Build an event notification frame:
/// `{event_id, tag_index, missed, udata, payload}`.
pub fn event_frame(event_id: u32, tag: u32, missed: u32, udata: u32, data: &[u8]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u32(event_id)
        .put_u32(tag)
        .put_u32(missed)
        .put_u32(udata)
        .put_bytes(data);
    response_frame(cmd::EVENT_NOTIFY, 0, &w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let h = MessageHeader {
            command: cmd::TAG_WRITE,
            size: 42,
            id: 7,
        };
        let buf = h.encode();
        assert_eq!(MessageHeader::decode(&buf), h);
        // little-endian on the wire
        assert_eq!(buf[0], 8);
        assert_eq!(buf[4], 42);
        assert_eq!(buf[8], 7);
    }

    #[test]
    fn test_error_flag() {
        let frame = error_frame(cmd::TAG_ADD, 3, ErrorCode::NotFound);
        let header = MessageHeader::decode(&frame[..HEADER_SIZE].try_into().unwrap());
        assert!(header.is_error());
        assert_eq!(header.base_command(), cmd::TAG_ADD);
        assert_eq!(header.id, 3);
        let mut r = PayloadReader::new(&frame[HEADER_SIZE..]);
        assert_eq!(
            ErrorCode::from_code(r.get_i32().unwrap()),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_payload_round_trip() {
        let mut w = PayloadWriter::new();
        w.put_u8(1)
            .put_u16(0x0203)
            .put_u32(0x04050607)
            .put_str("dummy")
            .put_bytes(&[9, 9]);
        let buf = w.into_bytes();
        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.get_u8().unwrap(), 1);
        assert_eq!(r.get_u16().unwrap(), 0x0203);
        assert_eq!(r.get_u32().unwrap(), 0x04050607);
        assert_eq!(r.get_str().unwrap(), "dummy");
        assert_eq!(r.get_rest(), vec![9, 9]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_handle_round_trip() {
        let h = TagHandle {
            index: 12,
            type_code: crate::types::DAX_INT,
            byte: 4,
            bit: 3,
            count: 10,
            size: 2,
        };
        let mut w = PayloadWriter::new();
        w.put_handle(&h);
        let buf = w.into_bytes();
        assert_eq!(buf.len(), 21);
        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.get_handle().unwrap(), h);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let mut r = PayloadReader::new(&[1, 2]);
        assert!(matches!(r.get_u32(), Err(ProtocolError::Malformed)));
        let mut r = PayloadReader::new(&[5, 0, b'a']);
        assert!(matches!(r.get_str(), Err(ProtocolError::Malformed)));
    }

    #[test]
    fn test_event_frame_layout() {
        let frame = event_frame(3, 9, 2, 0xAB, &[1, 2]);
        let header = MessageHeader::decode(&frame[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.command, cmd::EVENT_NOTIFY);
        assert_eq!(header.size, 18);
        let mut r = PayloadReader::new(&frame[HEADER_SIZE..]);
        assert_eq!(r.get_u32().unwrap(), 3);
        assert_eq!(r.get_u32().unwrap(), 9);
        assert_eq!(r.get_u32().unwrap(), 2);
        assert_eq!(r.get_u32().unwrap(), 0xAB);
        assert_eq!(r.get_rest(), vec![1, 2]);
    }
}
