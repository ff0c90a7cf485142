//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - frame_type: 1 byte (u8)
//! - session_id: 4 bytes (u32, big-endian, 0 = control)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::FrameType;
use crate::session::SessionId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub frame_type: FrameType,
    /// Session this frame belongs to
    pub session_id: SessionId,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(frame_type: FrameType, session_id: SessionId, payload_length: u32) -> Self {
        Self {
            frame_type,
            session_id,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u32(self.session_id.as_u32());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown frame type, or a
    /// session id that does not match the frame's scope). Nothing is
    /// consumed on error.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = Self::peek(&src[..HEADER_SIZE])?;
        src.advance(HEADER_SIZE);
        Ok(Some(header))
    }

    /// Parse a header from exactly `HEADER_SIZE` bytes without consuming them
    pub fn peek(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let type_byte = bytes[0];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        let mut cursor = &bytes[1..HEADER_SIZE];
        let session_id = SessionId::new(cursor.get_u32());
        let len_high = cursor.get_u8() as u32;
        let len_low = cursor.get_u16() as u32;
        let payload_length = (len_high << 16) | len_low;

        let header = Self {
            frame_type,
            session_id,
            payload_length,
        };
        header.check_scope()?;
        Ok(header)
    }

    /// Reject session ids that do not fit the frame type
    pub fn check_scope(&self) -> Result<(), ProtocolError> {
        let control = self.session_id.is_control();
        let bad = (self.frame_type.is_session_scoped() && control)
            || (self.frame_type.is_connection_scoped() && !control);
        if bad {
            return Err(ProtocolError::InvalidSessionScope {
                frame_type: self.frame_type.as_u8(),
                session_id: self.session_id.as_u32(),
            });
        }
        Ok(())
    }
}
