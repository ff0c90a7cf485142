//! Multiplexer sub-protocol
//!
//! Listing, attaching to, and creating sessions hosted by an external
//! multiplexer (`tmux`, `screen`) or a native pseudo-terminal. These messages
//! travel as binary frames (`0x60`..=`0x66`) rather than control-plane JSON.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::limits::{
    validate_env_pairs, validate_session_id, validate_shell_path, validate_working_dir,
};
use crate::message::TerminalSize;

/// Backend kind hosting a terminal session
///
/// Encoded as a single byte; codes outside the enumeration fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MultiplexerType {
    /// Native pseudo-terminal owned by the agent
    #[default]
    Native = 0,
    /// tmux
    Tmux = 1,
    /// GNU screen
    Screen = 2,
}

impl MultiplexerType {
    /// All backend kinds
    pub const ALL: [MultiplexerType; 3] = [
        MultiplexerType::Native,
        MultiplexerType::Tmux,
        MultiplexerType::Screen,
    ];

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Native),
            1 => Some(Self::Tmux),
            2 => Some(Self::Screen),
            _ => None,
        }
    }

    /// Lowercase name, as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Tmux => "tmux",
            Self::Screen => "screen",
        }
    }
}

impl TryFrom<u8> for MultiplexerType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownMultiplexerType(value))
    }
}

impl From<MultiplexerType> for u8 {
    fn from(value: MultiplexerType) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for MultiplexerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MultiplexerType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "pty" => Ok(Self::Native),
            "tmux" => Ok(Self::Tmux),
            "screen" => Ok(Self::Screen),
            other => Err(ProtocolError::invalid(
                "multiplexer",
                format!("unknown multiplexer {:?}; expected native, tmux or screen", other),
            )),
        }
    }
}

/// Static capability flags declared by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Can attach to sessions it did not create
    pub attach: bool,
    /// Sessions survive an agent restart
    pub persistence: bool,
    /// Supports multiple panes/windows per session
    pub multi_pane: bool,
    /// One session can be viewed by several clients
    pub sharing: bool,
    /// Has a copy/scrollback mode
    pub copy_mode: bool,
}

/// A session known to an external multiplexer
///
/// A transient snapshot; it has no lifecycle of its own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiplexerSessionInfo {
    /// Multiplexer's own session id
    pub external_id: String,
    /// Human-readable name
    pub name: String,
    /// Whether any client is attached
    pub attached: bool,
    /// Width reported by the multiplexer
    pub columns: u16,
    /// Height reported by the multiplexer
    pub rows: u16,
    /// Number of windows
    pub window_count: u32,
    /// Creation time (unix seconds, 0 when unknown)
    pub created_at: u64,
    /// Free-form extra fields
    pub metadata: HashMap<String, String>,
}

/// Availability and capabilities of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub multiplexer_type: MultiplexerType,
    pub available: bool,
    pub capabilities: BackendCapabilities,
}

/// `0x60`: list sessions of one multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSessionsRequest {
    pub multiplexer_type: MultiplexerType,
}

impl ListSessionsRequest {
    pub fn new(multiplexer_type: MultiplexerType) -> Self {
        Self { multiplexer_type }
    }
}

/// `0x61`: sessions reported by the multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub multiplexer_type: MultiplexerType,
    pub sessions: Vec<MultiplexerSessionInfo>,
    /// Empty on success
    pub error: String,
}

impl ListSessionsResponse {
    pub fn ok(multiplexer_type: MultiplexerType, sessions: Vec<MultiplexerSessionInfo>) -> Self {
        Self {
            multiplexer_type,
            sessions,
            error: String::new(),
        }
    }

    pub fn failed(multiplexer_type: MultiplexerType, error: impl Into<String>) -> Self {
        Self {
            multiplexer_type,
            sessions: Vec::new(),
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// `0x62`: attach to an existing external session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub multiplexer_type: MultiplexerType,
    pub external_id: String,
    pub size: TerminalSize,
}

impl AttachRequest {
    /// Build an attach request; `columns`/`rows` are validated here
    pub fn new(
        multiplexer_type: MultiplexerType,
        external_id: impl Into<String>,
        columns: u16,
        rows: u16,
    ) -> Result<Self, ProtocolError> {
        let request = Self {
            multiplexer_type,
            external_id: external_id.into(),
            size: TerminalSize::new(columns, rows)?,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_session_id(&self.external_id)
            .map_err(|_| ProtocolError::invalid("external_id", "must be 1..=256 characters"))
    }
}

/// `0x63`: result of an attach
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttachResponse {
    pub success: bool,
    /// Registry session id (empty on failure)
    pub session_id: String,
    pub external_id: String,
    /// Empty on success
    pub error: String,
}

impl AttachResponse {
    pub fn ok(session_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            external_id: external_id.into(),
            error: String::new(),
        }
    }

    pub fn failed(external_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: String::new(),
            external_id: external_id.into(),
            error: error.into(),
        }
    }
}

/// `0x64`: create a new multiplexer-backed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub multiplexer_type: MultiplexerType,
    /// External session name; empty lets the agent choose
    pub name: String,
    pub shell: Option<String>,
    pub size: TerminalSize,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl CreateRequest {
    /// Build a create request; `columns`/`rows` are validated here
    pub fn new(
        multiplexer_type: MultiplexerType,
        name: impl Into<String>,
        columns: u16,
        rows: u16,
    ) -> Result<Self, ProtocolError> {
        let request = Self {
            multiplexer_type,
            name: name.into(),
            shell: None,
            size: TerminalSize::new(columns, rows)?,
            working_dir: None,
            env: Vec::new(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Result<Self, ProtocolError> {
        self.shell = Some(shell.into());
        self.validate()?;
        Ok(self)
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Result<Self, ProtocolError> {
        self.working_dir = Some(dir.into());
        self.validate()?;
        Ok(self)
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Result<Self, ProtocolError> {
        self.env = env;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.name.chars().count() > crate::limits::MAX_SESSION_ID_LEN {
            return Err(ProtocolError::invalid("name", "longer than 256 characters"));
        }
        if let Some(shell) = &self.shell {
            validate_shell_path(shell)?;
        }
        if let Some(dir) = &self.working_dir {
            validate_working_dir(dir)?;
        }
        validate_env_pairs(&self.env)
    }
}

/// `0x65`: result of a create
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateResponse {
    pub success: bool,
    pub session_id: String,
    pub external_id: String,
    pub error: String,
}

impl CreateResponse {
    pub fn ok(session_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            external_id: external_id.into(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: String::new(),
            external_id: String::new(),
            error: error.into(),
        }
    }
}

/// `0x66`: backend capability advertisement
///
/// Sent by the agent after a connection is accepted. A client may send an
/// empty one to ask for a fresh copy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitiesMessage {
    pub backends: Vec<BackendDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplexer_codes() {
        assert_eq!(MultiplexerType::Native.as_u8(), 0);
        assert_eq!(MultiplexerType::Tmux.as_u8(), 1);
        assert_eq!(MultiplexerType::Screen.as_u8(), 2);
        assert!(MultiplexerType::from_u8(3).is_none());
        assert!(MultiplexerType::try_from(9u8).is_err());
    }

    #[test]
    fn test_multiplexer_from_str() {
        assert_eq!("tmux".parse::<MultiplexerType>().unwrap(), MultiplexerType::Tmux);
        assert_eq!("PTY".parse::<MultiplexerType>().unwrap(), MultiplexerType::Native);
        assert!("zellij".parse::<MultiplexerType>().is_err());
    }

    #[test]
    fn test_create_request_rejects_bad_geometry() {
        assert!(CreateRequest::new(MultiplexerType::Tmux, "dev", 0, 24).is_err());
        assert!(CreateRequest::new(MultiplexerType::Tmux, "dev", 80, 501).is_err());
        assert!(CreateRequest::new(MultiplexerType::Tmux, "dev", 1, 500).is_ok());
    }

    #[test]
    fn test_create_request_builders_validate() {
        let request = CreateRequest::new(MultiplexerType::Screen, "", 80, 24).unwrap();
        assert!(request.clone().with_shell("").is_err());
        assert!(request
            .clone()
            .with_env(vec![("TERM".into(), "xterm".into())])
            .is_ok());
    }

    #[test]
    fn test_attach_request_requires_external_id() {
        assert!(AttachRequest::new(MultiplexerType::Tmux, "", 80, 24).is_err());
        assert!(AttachRequest::new(MultiplexerType::Tmux, "main", 80, 24).is_ok());
    }
}
