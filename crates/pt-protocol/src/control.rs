//! Control-plane messages
//!
//! JSON objects tagged by `type` and stamped with a protocol version `v`,
//! carried inside [`FrameType::Control`](crate::FrameType::Control) frames.
//! Requests that carry user-controlled sizes or strings are validated when
//! constructed and again when parsed, so a request that reaches the session
//! registry is always within bounds.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Frame, FramePayload};
use crate::error::ProtocolError;
use crate::limits::{
    validate_clipboard, validate_columns, validate_env, validate_rows, validate_session_id,
    validate_shell_path, validate_token, validate_working_dir,
};
use crate::message::{TerminalSize, PROTOCOL_VERSION};
use crate::mux::{BackendDescriptor, MultiplexerType};
use crate::session::SessionState;

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request parameters out of bounds or malformed
    InvalidRequest,
    /// Unknown session id
    SessionNotFound,
    /// Global or per-connection session ceiling reached
    SessionLimit,
    /// Connection ceiling reached
    ConnectionLimit,
    /// Session is not in a state that allows the operation
    InvalidState,
    /// Session does not allow reconnection
    NotReconnectable,
    /// Authentication missing or rejected
    AuthFailed,
    /// Requested backend is not registered or not available
    NoBackend,
    /// Shell or multiplexer process failed
    BackendError,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SessionLimit | ErrorCode::ConnectionLimit | ErrorCode::BackendError
        )
    }
}

fn default_true() -> bool {
    true
}

/// Parameters for `create_session`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-chosen id, for idempotent retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Shell path; the agent's default shell when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub columns: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Backend; the agent's preferred multiplexer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer: Option<MultiplexerType>,
    #[serde(default = "default_true")]
    pub enable_reconnection: bool,
}

impl CreateSessionRequest {
    /// Start a request with the given geometry
    pub fn new(columns: u16, rows: u16) -> Result<Self, ProtocolError> {
        validate_columns(columns)?;
        validate_rows(rows)?;
        Ok(Self {
            session_id: None,
            shell: None,
            columns,
            rows,
            working_dir: None,
            env: HashMap::new(),
            multiplexer: None,
            enable_reconnection: true,
        })
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        validate_session_id(&id)?;
        self.session_id = Some(id);
        Ok(self)
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Result<Self, ProtocolError> {
        let shell = shell.into();
        validate_shell_path(&shell)?;
        self.shell = Some(shell);
        Ok(self)
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Result<Self, ProtocolError> {
        let dir = dir.into();
        validate_working_dir(&dir)?;
        self.working_dir = Some(dir);
        Ok(self)
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Result<Self, ProtocolError> {
        validate_env(&env)?;
        self.env = env;
        Ok(self)
    }

    pub fn with_multiplexer(mut self, multiplexer: MultiplexerType) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    pub fn with_reconnection(mut self, enabled: bool) -> Self {
        self.enable_reconnection = enabled;
        self
    }

    /// Validated terminal size
    pub fn size(&self) -> Result<TerminalSize, ProtocolError> {
        TerminalSize::new(self.columns, self.rows)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_columns(self.columns)?;
        validate_rows(self.rows)?;
        if let Some(id) = &self.session_id {
            validate_session_id(id)?;
        }
        if let Some(shell) = &self.shell {
            validate_shell_path(shell)?;
        }
        if let Some(dir) = &self.working_dir {
            validate_working_dir(dir)?;
        }
        validate_env(&self.env)
    }
}

/// Parameters for `resize_session`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSessionRequest {
    pub session_id: String,
    pub columns: u16,
    pub rows: u16,
}

impl ResizeSessionRequest {
    pub fn new(session_id: impl Into<String>, columns: u16, rows: u16) -> Result<Self, ProtocolError> {
        let request = Self {
            session_id: session_id.into(),
            columns,
            rows,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn size(&self) -> Result<TerminalSize, ProtocolError> {
        TerminalSize::new(self.columns, self.rows)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_session_id(&self.session_id)?;
        self.size().map(|_| ())
    }
}

/// Client → agent requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a shared token
    Authenticate { token: String },
    /// Create a terminal session
    CreateSession(CreateSessionRequest),
    /// Close a session
    CloseSession { session_id: String },
    /// Resize a session's terminal
    ResizeSession(ResizeSessionRequest),
    /// List sessions owned by this connection
    ListSessions,
    /// Rebind a disconnected session to this connection
    ReconnectSession { session_id: String },
    /// Keepalive
    Ping { timestamp: u64 },
    /// Agent information
    GetInfo,
    /// Push a clipboard entry
    ClipboardCopy { content: String },
    /// Fetch clipboard history, newest first
    ClipboardHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

impl ClientMessage {
    pub fn authenticate(token: impl Into<String>) -> Result<Self, ProtocolError> {
        let msg = ClientMessage::Authenticate {
            token: token.into(),
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn close_session(session_id: impl Into<String>) -> Result<Self, ProtocolError> {
        let msg = ClientMessage::CloseSession {
            session_id: session_id.into(),
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn reconnect_session(session_id: impl Into<String>) -> Result<Self, ProtocolError> {
        let msg = ClientMessage::ReconnectSession {
            session_id: session_id.into(),
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn clipboard_copy(content: impl Into<String>) -> Result<Self, ProtocolError> {
        let msg = ClientMessage::ClipboardCopy {
            content: content.into(),
        };
        msg.validate()?;
        Ok(msg)
    }

    /// Check every bounded field
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::Authenticate { token } => validate_token(token),
            ClientMessage::CreateSession(request) => request.validate(),
            ClientMessage::CloseSession { session_id }
            | ClientMessage::ReconnectSession { session_id } => validate_session_id(session_id),
            ClientMessage::ResizeSession(request) => request.validate(),
            ClientMessage::ClipboardCopy { content } => validate_clipboard(content),
            ClientMessage::ListSessions
            | ClientMessage::Ping { .. }
            | ClientMessage::GetInfo
            | ClientMessage::ClipboardHistory { .. } => Ok(()),
        }
    }

    /// The registry session this request concerns, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::CloseSession { session_id }
            | ClientMessage::ReconnectSession { session_id } => Some(session_id),
            ClientMessage::ResizeSession(request) => Some(&request.session_id),
            ClientMessage::CreateSession(request) => request.session_id.as_deref(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        to_versioned_json(self)
    }

    /// Parse and validate
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = from_versioned_json(text)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::connection(FramePayload::Control(self.to_json()?)))
    }
}

/// Registry session as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    /// Id used in binary frame headers
    pub wire_id: u32,
    pub state: SessionState,
    pub shell: Option<String>,
    pub columns: u16,
    pub rows: u16,
    pub multiplexer: MultiplexerType,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis
    pub last_activity_at: u64,
    pub reconnect_count: u32,
}

/// Agent information returned by `get_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub protocol_version: u64,
    pub default_shell: Option<String>,
    pub shells: Vec<String>,
    pub backends: Vec<BackendDescriptor>,
    pub max_sessions_per_connection: u32,
    pub max_total_sessions: u32,
}

/// One clipboard history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardEntry {
    pub id: u64,
    pub content: String,
    pub source_connection: String,
    /// Unix millis
    pub created_at: u64,
}

/// Agent → client responses and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every accepted connection
    Connected {
        connection_id: String,
        server_version: String,
        requires_auth: bool,
    },
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SessionCreated { session: SessionSummary },
    SessionClosed { session_id: String, reason: String },
    SessionReconnected {
        session: SessionSummary,
        /// Bytes of buffered output replayed after this message
        replayed_bytes: u64,
    },
    SessionList { sessions: Vec<SessionSummary> },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Pong { timestamp: u64 },
    ServerInfo(ServerInfo),
    ServerShutdown { reason: String },
    ClipboardUpdated { entry: ClipboardEntry },
    ClipboardHistory { entries: Vec<ClipboardEntry> },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            session_id,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        to_versioned_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        from_versioned_json(text)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::connection(FramePayload::Control(self.to_json()?)))
    }
}

fn to_versioned_json<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(message)?;
    if let Value::Object(map) = &mut value {
        map.insert("v".to_string(), Value::from(PROTOCOL_VERSION));
    }
    Ok(serde_json::to_string(&value)?)
}

fn from_versioned_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let mut value: Value = serde_json::from_str(text)?;
    let version = match value.as_object_mut().and_then(|map| map.remove("v")) {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| ProtocolError::invalid("v", "must be an unsigned integer"))?,
        None => PROTOCOL_VERSION,
    };
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(serde_json::from_value(value)?)
}
