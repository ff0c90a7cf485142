//! Native pseudo-terminal backend
//!
//! One shell process per session, owned by the agent. Nothing survives an
//! agent restart.

use std::io::Read;

use async_trait::async_trait;

use pt_core::{BackendError, BackendSession, BackendSessionConfig, TerminalBackend};
use pt_protocol::{BackendCapabilities, MultiplexerSessionInfo, MultiplexerType, TerminalSize};

use crate::pty::{PtyPool, SpawnSpec};

pub struct NativeBackend {
    pool: PtyPool,
}

impl NativeBackend {
    pub const CAPABILITIES: BackendCapabilities = BackendCapabilities {
        attach: false,
        persistence: false,
        multi_pane: false,
        sharing: false,
        copy_mode: false,
    };

    pub fn new() -> Self {
        Self {
            pool: PtyPool::new(),
        }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBackend for NativeBackend {
    fn multiplexer_type(&self) -> MultiplexerType {
        MultiplexerType::Native
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::CAPABILITIES
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_session(
        &self,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        let shell = config
            .shell
            .as_ref()
            .ok_or_else(|| BackendError::Spawn("no shell given for native session".to_string()))?;

        let spec = SpawnSpec {
            program: shell.program.clone(),
            args: shell.args.clone(),
            size: config.size,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
        };
        let pid = self.pool.spawn(&config.session_id, spec)?;

        Ok(BackendSession {
            external_id: None,
            pid,
        })
    }

    async fn attach_session(
        &self,
        external_id: &str,
        _config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        Err(BackendError::Command {
            command: "attach".to_string(),
            message: format!(
                "native sessions cannot be re-attached (requested {})",
                external_id
            ),
        })
    }

    async fn list_sessions(&self) -> Result<Vec<MultiplexerSessionInfo>, BackendError> {
        Ok(vec![])
    }

    async fn write_input(&self, session_id: &str, data: &[u8]) -> Result<(), BackendError> {
        self.pool.write(session_id, data).await
    }

    fn take_output(&self, session_id: &str) -> Result<Box<dyn Read + Send>, BackendError> {
        self.pool.take_reader(session_id)
    }

    async fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), BackendError> {
        self.pool.resize(session_id, size)
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.pool.terminate(session_id).await.map(|_| ())
    }

    fn has_session(&self, session_id: &str) -> bool {
        self.pool.contains(session_id)
    }

    fn exit_status(&self, session_id: &str) -> Option<i32> {
        self.pool.exit_status(session_id)
    }

    async fn shutdown(&self) {
        self.pool.terminate_all().await;
    }
}
