//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
///
/// Decode failures are fatal to the frame (and, on a stream, to the
/// connection that produced it). `InvalidArgument` is raised when a message
/// is constructed with a field outside its bounds, before any frame exists.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A field violated its bounds at construction time
    #[error("Invalid argument `{field}`: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    /// Unknown frame type code
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Unknown multiplexer code
    #[error("Unknown multiplexer type: {0}")]
    UnknownMultiplexerType(u8),

    /// Session id does not fit the frame's scope
    #[error("Frame type {frame_type:#04x} cannot carry session id {session_id}")]
    InvalidSessionScope { frame_type: u8, session_id: u32 },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Incomplete frame received
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Bytes left over after a complete frame
    #[error("Trailing data: {0} bytes after end of frame")]
    TrailingData(usize),

    /// Control message declared a version we do not speak
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    /// Binary payload serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Control message JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Build an argument error for `field`
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    /// Whether this is a construction-time validation failure rather than a decode failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}
