//! Core error types for pocket-terminal

use std::path::PathBuf;
use std::time::Duration;

use pt_protocol::{ErrorCode, MultiplexerType, ProtocolError, SessionState};
use thiserror::Error;

/// Top-level error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Malformed or out-of-bounds request, or a bad frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session registry rejected the operation
    #[error("Session error: {0}")]
    Registry(#[from] RegistryError),

    /// Shell or multiplexer process failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Shell validation failed
    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    /// Authentication missing or rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Too many concurrent connections
    #[error("Connection limit reached ({max})")]
    ConnectionLimit { max: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Stable control-plane code for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Protocol(_) | AgentError::Shell(_) => ErrorCode::InvalidRequest,
            AgentError::Registry(e) => e.code(),
            AgentError::Backend(e) => e.code(),
            AgentError::AuthFailed(_) => ErrorCode::AuthFailed,
            AgentError::ConnectionLimit { .. } => ErrorCode::ConnectionLimit,
            AgentError::Config(_) | AgentError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Session the failure concerns, when there is one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentError::Registry(e) => e.session_id(),
            AgentError::Backend(BackendError::NotFound(id)) => Some(id),
            _ => None,
        }
    }
}

/// Session registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Global session ceiling reached
    #[error("Session limit exceeded ({max} sessions)")]
    SessionLimit { max: usize },

    /// Connection already holds its maximum number of sessions
    #[error("Connection {connection_id} already holds {max} sessions")]
    ConnectionSessionLimit { connection_id: String, max: usize },

    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Caller-supplied id collides with a live session
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Session is not in the state the operation needs
    #[error("Session {session_id} is {state}, expected {expected}")]
    InvalidState {
        session_id: String,
        state: SessionState,
        expected: SessionState,
    },

    /// Session was created without reconnection
    #[error("Session {0} does not allow reconnection")]
    NotReconnectable(String),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::SessionLimit { .. } | RegistryError::ConnectionSessionLimit { .. } => {
                ErrorCode::SessionLimit
            }
            RegistryError::NotFound(_) => ErrorCode::SessionNotFound,
            RegistryError::AlreadyExists(_) => ErrorCode::InvalidRequest,
            RegistryError::InvalidState { .. } => ErrorCode::InvalidState,
            RegistryError::NotReconnectable(_) => ErrorCode::NotReconnectable,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RegistryError::NotFound(id)
            | RegistryError::AlreadyExists(id)
            | RegistryError::NotReconnectable(id) => Some(id),
            RegistryError::InvalidState { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Whether the caller may succeed by retrying later
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            RegistryError::SessionLimit { .. } | RegistryError::ConnectionSessionLimit { .. }
        )
    }
}

/// Terminal backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    /// `initialize()` has not succeeded yet
    #[error("{0} backend is not initialized")]
    NotInitialized(MultiplexerType),

    /// Executable not found on this host
    #[error("{0} is not available on this host")]
    Unavailable(MultiplexerType),

    /// External session name rejected before invoking the multiplexer
    #[error("Invalid session name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// No live process for the session
    #[error("No backend process for session {0}")]
    NotFound(String),

    /// Process could not be started
    #[error("Failed to spawn terminal process: {0}")]
    Spawn(String),

    /// Multiplexer command exited unsuccessfully
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    /// Multiplexer command did not finish in time
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// I/O error talking to the process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::NotInitialized(_) | BackendError::Unavailable(_) => ErrorCode::NoBackend,
            BackendError::InvalidName { .. } => ErrorCode::InvalidRequest,
            BackendError::NotFound(_) => ErrorCode::SessionNotFound,
            BackendError::Spawn(_)
            | BackendError::Command { .. }
            | BackendError::Timeout { .. }
            | BackendError::Io(_) => ErrorCode::BackendError,
        }
    }

    /// Whether this is a fail-fast validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, BackendError::InvalidName { .. })
    }
}

/// Shell detection and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    #[error("Shell does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Shell is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("Shell is not in the allowed shell list: {0}")]
    NotAllowed(PathBuf),

    #[error("No usable shell found on this host")]
    NoShellAvailable,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_codes() {
        let err = AgentError::from(RegistryError::NotFound("abc".into()));
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.session_id(), Some("abc"));

        let err = AgentError::from(RegistryError::SessionLimit { max: 3 });
        assert_eq!(err.code(), ErrorCode::SessionLimit);
        assert_eq!(err.session_id(), None);
    }

    #[test]
    fn test_backend_codes() {
        let err = AgentError::from(BackendError::Unavailable(MultiplexerType::Screen));
        assert_eq!(err.code(), ErrorCode::NoBackend);

        let err = AgentError::from(BackendError::InvalidName {
            name: "a:b".into(),
            reason: "contains ':'".into(),
        });
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_validation_maps_to_invalid_request() {
        let err = AgentError::from(ProtocolError::invalid("rows", "too big"));
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }
}
