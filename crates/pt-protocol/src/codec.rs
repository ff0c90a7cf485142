//! Tokio codec for framed protocol messages

use bincode::Options;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::{FrameType, TerminalSize};
use crate::mux::{
    AttachRequest, AttachResponse, CapabilitiesMessage, CreateRequest, CreateResponse,
    ListSessionsRequest, ListSessionsResponse,
};
use crate::session::SessionId;

/// Typed contents of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Raw terminal bytes
    Data(Bytes),
    /// Terminal resize
    Resize(TerminalSize),
    /// Session ended; exit code when the process reported one
    SessionClosed { exit_code: Option<i32> },
    /// Control-plane JSON text
    Control(String),
    MuxList(ListSessionsRequest),
    MuxListResponse(ListSessionsResponse),
    MuxAttach(AttachRequest),
    MuxAttachResponse(AttachResponse),
    MuxCreate(CreateRequest),
    MuxCreateResponse(CreateResponse),
    Capabilities(CapabilitiesMessage),
}

impl FramePayload {
    /// Frame type code for this payload
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::Data(_) => FrameType::Data,
            FramePayload::Resize(_) => FrameType::Resize,
            FramePayload::SessionClosed { .. } => FrameType::SessionClosed,
            FramePayload::Control(_) => FrameType::Control,
            FramePayload::MuxList(_) => FrameType::MuxList,
            FramePayload::MuxListResponse(_) => FrameType::MuxListResponse,
            FramePayload::MuxAttach(_) => FrameType::MuxAttach,
            FramePayload::MuxAttachResponse(_) => FrameType::MuxAttachResponse,
            FramePayload::MuxCreate(_) => FrameType::MuxCreate,
            FramePayload::MuxCreateResponse(_) => FrameType::MuxCreateResponse,
            FramePayload::Capabilities(_) => FrameType::Capabilities,
        }
    }

    fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let bytes = match self {
            FramePayload::Data(data) => data.clone(),
            FramePayload::Control(text) => Bytes::copy_from_slice(text.as_bytes()),
            FramePayload::Resize(size) => serialize(size)?,
            FramePayload::SessionClosed { exit_code } => serialize(exit_code)?,
            FramePayload::MuxList(m) => serialize(m)?,
            FramePayload::MuxListResponse(m) => serialize(m)?,
            FramePayload::MuxAttach(m) => serialize(m)?,
            FramePayload::MuxAttachResponse(m) => serialize(m)?,
            FramePayload::MuxCreate(m) => serialize(m)?,
            FramePayload::MuxCreateResponse(m) => serialize(m)?,
            FramePayload::Capabilities(m) => serialize(m)?,
        };
        Ok(bytes)
    }

    fn from_bytes(frame_type: FrameType, bytes: Bytes) -> Result<Self, ProtocolError> {
        let payload = match frame_type {
            FrameType::Data => FramePayload::Data(bytes),
            FrameType::Control => {
                let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ProtocolError::invalid("control", format!("payload is not UTF-8: {}", e))
                })?;
                FramePayload::Control(text)
            }
            FrameType::Resize => FramePayload::Resize(deserialize(&bytes)?),
            FrameType::SessionClosed => FramePayload::SessionClosed {
                exit_code: deserialize(&bytes)?,
            },
            FrameType::MuxList => FramePayload::MuxList(deserialize(&bytes)?),
            FrameType::MuxListResponse => FramePayload::MuxListResponse(deserialize(&bytes)?),
            FrameType::MuxAttach => {
                let request: AttachRequest = deserialize(&bytes)?;
                request.validate()?;
                FramePayload::MuxAttach(request)
            }
            FrameType::MuxAttachResponse => FramePayload::MuxAttachResponse(deserialize(&bytes)?),
            FrameType::MuxCreate => {
                let request: CreateRequest = deserialize(&bytes)?;
                request.validate()?;
                FramePayload::MuxCreate(request)
            }
            FrameType::MuxCreateResponse => FramePayload::MuxCreateResponse(deserialize(&bytes)?),
            FrameType::Capabilities => FramePayload::Capabilities(deserialize(&bytes)?),
        };
        Ok(payload)
    }
}

fn payload_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_SIZE as u64)
}

fn serialize<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(payload_options().serialize(value)?))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(payload_options().deserialize(bytes)?)
}

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Session ID this frame belongs to
    pub session_id: SessionId,
    /// The typed payload
    pub payload: FramePayload,
}

impl Frame {
    /// Create a new frame
    pub fn new(session_id: SessionId, payload: FramePayload) -> Self {
        Self {
            session_id,
            payload,
        }
    }

    /// Connection-scoped frame (session id 0)
    pub fn connection(payload: FramePayload) -> Self {
        Self::new(SessionId::CONTROL, payload)
    }

    /// Terminal data for a session
    pub fn data(session_id: SessionId, data: impl Into<Bytes>) -> Self {
        Self::new(session_id, FramePayload::Data(data.into()))
    }

    /// Resize for a session
    pub fn resize(session_id: SessionId, size: TerminalSize) -> Self {
        Self::new(session_id, FramePayload::Resize(size))
    }

    /// Session-ended notification
    pub fn session_closed(session_id: SessionId, exit_code: Option<i32>) -> Self {
        Self::new(session_id, FramePayload::SessionClosed { exit_code })
    }

    /// Frame type of the payload
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    /// Append the encoded frame to `dst`
    ///
    /// Nothing is written if the payload is too large or the session id
    /// does not fit the frame type.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = self.payload.to_bytes()?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(self.frame_type(), self.session_id, payload_len as u32);
        header.check_scope()?;

        dst.reserve(HEADER_SIZE + payload_len);
        header.encode(dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one frame from `bytes`
    ///
    /// Fails on truncated input, trailing bytes, an unknown type code, or a
    /// payload that does not match its declared type.
    pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
        let header = FrameHeader::peek(bytes)?;
        let payload_len = header.payload_length as usize;
        let expected = HEADER_SIZE + payload_len;

        if bytes.len() < expected {
            return Err(ProtocolError::IncompleteFrame {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(ProtocolError::TrailingData(bytes.len() - expected));
        }

        let payload = Bytes::copy_from_slice(&bytes[HEADER_SIZE..]);
        Ok(Frame {
            session_id: header.session_id,
            payload: FramePayload::from_bytes(header.frame_type, payload)?,
        })
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Check if we have enough data for the payload
        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let payload = FramePayload::from_bytes(header.frame_type, payload_bytes)?;

        Ok(Some(Frame {
            session_id: header.session_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst)
    }
}
