//! Terminal backend trait
//!
//! A backend owns the live process behind a session. The registry decides
//! whether a session exists; the backend knows whether its process is
//! still running.

use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;
use pt_protocol::{BackendCapabilities, MultiplexerSessionInfo, MultiplexerType, TerminalSize};

use crate::error::BackendError;
use crate::shell::ShellCommand;

/// Parameters for starting or attaching a backend session
#[derive(Debug, Clone)]
pub struct BackendSessionConfig {
    /// Registry session id the process is keyed by
    pub session_id: String,
    /// Name for the external multiplexer session (tmux/screen only)
    pub name: Option<String>,
    /// Shell to start. `None` lets the multiplexer pick its own default.
    pub shell: Option<ShellCommand>,
    pub size: TerminalSize,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Attach as owner: destroying the session also ends the external
    /// multiplexer session. Created sessions are always owned.
    pub owned: bool,
}

impl BackendSessionConfig {
    pub fn new(session_id: impl Into<String>, size: TerminalSize) -> Self {
        Self {
            session_id: session_id.into(),
            name: None,
            shell: None,
            size,
            working_dir: None,
            env: vec![],
            owned: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_shell(mut self, shell: ShellCommand) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_ownership(mut self, owned: bool) -> Self {
        self.owned = owned;
        self
    }
}

/// What a backend reports after starting or attaching a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSession {
    /// Name of the external multiplexer session, if any
    pub external_id: Option<String>,
    /// Process id of the local client process
    pub pid: Option<u32>,
}

/// One process-management strategy: native PTY, tmux or screen
///
/// Callers branch on [`TerminalBackend::capabilities`], never on the
/// concrete type.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    fn multiplexer_type(&self) -> MultiplexerType;

    fn capabilities(&self) -> BackendCapabilities;

    /// False until `initialize()` has succeeded
    fn is_available(&self) -> bool;

    /// Locate executables and prepare the backend
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Start a new terminal process for `config.session_id`
    async fn create_session(
        &self,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError>;

    /// Attach `config.session_id` to an existing external session
    async fn attach_session(
        &self,
        external_id: &str,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError>;

    /// Snapshot of sessions known to the external multiplexer.
    ///
    /// An empty result is `Ok(vec![])`, never an error.
    async fn list_sessions(&self) -> Result<Vec<MultiplexerSessionInfo>, BackendError>;

    /// Write client input to the session
    async fn write_input(&self, session_id: &str, data: &[u8]) -> Result<(), BackendError>;

    /// Blocking reader over the session's output
    fn take_output(&self, session_id: &str) -> Result<Box<dyn Read + Send>, BackendError>;

    async fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), BackendError>;

    /// Stop the local process. Multiplexer backends also kill the external
    /// session, unless it was joined without ownership.
    async fn destroy_session(&self, session_id: &str) -> Result<(), BackendError>;

    /// Whether a live process is held for `session_id`
    fn has_session(&self, session_id: &str) -> bool;

    /// Exit code if the session's process has finished
    fn exit_status(&self, session_id: &str) -> Option<i32>;

    /// Release resources. Multiplexer backends detach their local clients
    /// and leave external sessions running. Safe to call when never
    /// initialized.
    async fn shutdown(&self);
}
