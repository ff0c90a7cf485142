//! pt-protocol: Wire protocol for pocket-terminal session multiplexing
//!
//! This crate defines the binary frame format that multiplexes terminal
//! data and multiplexer-control messages over one transport connection,
//! and the JSON control-plane messages carried inside control frames.

pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod limits;
pub mod message;
pub mod mux;
pub mod session;

pub use codec::{Frame, FrameCodec, FramePayload};
pub use control::{
    ClientMessage, ClipboardEntry, CreateSessionRequest, ErrorCode, ResizeSessionRequest,
    ServerInfo, ServerMessage, SessionSummary,
};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{FrameType, TerminalSize, PROTOCOL_VERSION};
pub use mux::{
    AttachRequest, AttachResponse, BackendCapabilities, BackendDescriptor, CapabilitiesMessage,
    CreateRequest, CreateResponse, ListSessionsRequest, ListSessionsResponse,
    MultiplexerSessionInfo, MultiplexerType,
};
pub use session::{SessionId, SessionState};
