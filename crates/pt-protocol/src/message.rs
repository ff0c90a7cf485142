//! Frame types and terminal geometry
//!
//! Every unit on the wire is a frame whose first byte names its kind. Terminal
//! traffic (data, resize, close) is bound to a session through the header's
//! session id; everything else is connection-scoped and uses
//! [`SessionId::CONTROL`](crate::SessionId::CONTROL).
//!
//! # Message Flow
//!
//! 1. Client connects; agent sends a `connected` control message and a
//!    `Capabilities` frame describing its backends
//! 2. Client sends control requests (`create_session`, `reconnect_session`, ...)
//!    inside `Control` frames, or multiplexer requests as `MuxCreate`/`MuxAttach`
//! 3. Terminal I/O: `Data` frames flow bidirectionally, keyed by session id
//! 4. Window resize: `Resize` from the client
//! 5. Session end: `SessionClosed` from the agent

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::limits::{validate_columns, validate_rows};

/// Current control-plane protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

/// Terminal dimensions
///
/// Construction validates `columns` in 1..=1000 and `rows` in 1..=500;
/// deserialization goes through the same check, so an out-of-range size can
/// never exist as a value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTerminalSize")]
pub struct TerminalSize {
    /// Number of columns
    pub columns: u16,
    /// Number of rows
    pub rows: u16,
}

#[derive(Deserialize)]
struct RawTerminalSize {
    columns: u16,
    rows: u16,
}

impl TryFrom<RawTerminalSize> for TerminalSize {
    type Error = ProtocolError;

    fn try_from(raw: RawTerminalSize) -> Result<Self, Self::Error> {
        TerminalSize::new(raw.columns, raw.rows)
    }
}

impl TerminalSize {
    /// Create a validated terminal size
    pub fn new(columns: u16, rows: u16) -> Result<Self, ProtocolError> {
        validate_columns(columns)?;
        validate_rows(rows)?;
        Ok(Self { columns, rows })
    }

    /// Default terminal size (80x24)
    pub const fn default_size() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Raw terminal bytes (either direction)
    Data = 0x01,
    /// Terminal resize
    Resize = 0x02,
    /// Session ended on the agent side
    SessionClosed = 0x03,
    /// Control-plane JSON message
    Control = 0x10,
    /// List sessions known to an external multiplexer
    MuxList = 0x60,
    /// Response to `MuxList`
    MuxListResponse = 0x61,
    /// Attach to an existing multiplexer session
    MuxAttach = 0x62,
    /// Response to `MuxAttach`
    MuxAttachResponse = 0x63,
    /// Create a new multiplexer-backed session
    MuxCreate = 0x64,
    /// Response to `MuxCreate`
    MuxCreateResponse = 0x65,
    /// Backend capability advertisement
    Capabilities = 0x66,
}

impl FrameType {
    /// Every frame type, in code order
    pub const ALL: [FrameType; 11] = [
        FrameType::Data,
        FrameType::Resize,
        FrameType::SessionClosed,
        FrameType::Control,
        FrameType::MuxList,
        FrameType::MuxListResponse,
        FrameType::MuxAttach,
        FrameType::MuxAttachResponse,
        FrameType::MuxCreate,
        FrameType::MuxCreateResponse,
        FrameType::Capabilities,
    ];

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Resize),
            0x03 => Some(Self::SessionClosed),
            0x10 => Some(Self::Control),
            0x60 => Some(Self::MuxList),
            0x61 => Some(Self::MuxListResponse),
            0x62 => Some(Self::MuxAttach),
            0x63 => Some(Self::MuxAttachResponse),
            0x64 => Some(Self::MuxCreate),
            0x65 => Some(Self::MuxCreateResponse),
            0x66 => Some(Self::Capabilities),
            _ => None,
        }
    }

    /// Frames that must name a terminal session (non-zero session id)
    pub fn is_session_scoped(&self) -> bool {
        matches!(self, Self::Data | Self::Resize | Self::SessionClosed)
    }

    /// Frames that must use the control session id
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Self::Control
                | Self::MuxList
                | Self::MuxListResponse
                | Self::MuxAttach
                | Self::MuxAttachResponse
                | Self::MuxCreate
                | Self::MuxCreateResponse
                | Self::Capabilities
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for frame_type in FrameType::ALL {
            let byte = frame_type.as_u8();
            let recovered = FrameType::from_u8(byte).unwrap();
            assert_eq!(recovered, frame_type);
        }
    }

    #[test]
    fn test_data_codes_do_not_collide_with_mux_range() {
        for frame_type in [FrameType::Data, FrameType::Resize, FrameType::SessionClosed] {
            assert!(!(0x60..=0x66).contains(&frame_type.as_u8()));
        }
    }

    #[test]
    fn test_unknown_code() {
        assert!(FrameType::from_u8(0x00).is_none());
        assert!(FrameType::from_u8(0x67).is_none());
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.columns, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_terminal_size_rejects_out_of_range() {
        assert!(TerminalSize::new(0, 24).is_err());
        assert!(TerminalSize::new(80, 501).is_err());
        assert!(TerminalSize::new(1, 500).is_ok());
    }

    #[test]
    fn test_terminal_size_deserialize_validates() {
        let ok: TerminalSize = serde_json::from_str(r#"{"columns":1,"rows":500}"#).unwrap();
        assert_eq!(ok, TerminalSize::new(1, 500).unwrap());

        let bad = serde_json::from_str::<TerminalSize>(r#"{"columns":1001,"rows":24}"#);
        assert!(bad.is_err());
    }
}
