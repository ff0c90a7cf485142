//! GNU screen-backed sessions
//!
//! Same shape as the tmux backend: `screen -dmS` starts a detached session
//! and a `screen -x` client inside a PTY carries the I/O.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;

use pt_core::{BackendError, BackendSession, BackendSessionConfig, TerminalBackend};
use pt_protocol::{BackendCapabilities, MultiplexerSessionInfo, MultiplexerType, TerminalSize};

use super::command::{default_name, validate_name, Executable, ExternalSessions};
use crate::pty::{PtyPool, SpawnSpec};

/// `.` separates pid and name in screen session ids; `/` and `:` break
/// socket paths and `-S` matching
const FORBIDDEN_NAME_CHARS: &[char] = &['.', '/', ':'];

pub struct ScreenBackend {
    screen: Executable,
    pool: PtyPool,
    /// Registry session id to screen session id
    names: ExternalSessions,
}

impl ScreenBackend {
    pub const CAPABILITIES: BackendCapabilities = BackendCapabilities {
        attach: true,
        persistence: true,
        multi_pane: true,
        sharing: true,
        copy_mode: true,
    };

    pub fn new() -> Self {
        Self::with_executable(Executable::new(MultiplexerType::Screen, "screen"))
    }

    fn with_executable(screen: Executable) -> Self {
        Self {
            screen,
            pool: PtyPool::new(),
            names: ExternalSessions::default(),
        }
    }

    pub fn validate_name(name: &str) -> Result<(), BackendError> {
        validate_name(name, FORBIDDEN_NAME_CHARS)
    }

    /// Validate an external id, which may be `name` or `pid.name`
    fn validate_external_id(external_id: &str) -> Result<(), BackendError> {
        match external_id.split_once('.') {
            Some((pid, name)) if !pid.is_empty() && pid.chars().all(|c| c.is_ascii_digit()) => {
                Self::validate_name(name)
            }
            _ => Self::validate_name(external_id),
        }
    }

    fn attach_client(
        &self,
        external_id: &str,
        config: &BackendSessionConfig,
        owned: bool,
    ) -> Result<Option<u32>, BackendError> {
        let program = self.screen.path()?.to_path_buf();
        // -x joins without detaching other viewers
        let mut spec = SpawnSpec::new(program, config.size).args(["-x", external_id]);
        spec.working_dir = config.working_dir.clone();
        spec.env = config.env.clone();

        let pid = self.pool.spawn(&config.session_id, spec)?;
        self.names.track(&config.session_id, external_id, owned);
        Ok(pid)
    }

    async fn quit_external(&self, external_id: &str) {
        match self.screen.run(&["-S", external_id, "-X", "quit"]).await {
            Ok(output) if !output.success => {
                tracing::debug!("screen quit {}: {}", external_id, output.stdout.trim());
            }
            Ok(_) => tracing::info!("Quit screen session {}", external_id),
            Err(e) => tracing::warn!("Failed to quit screen session {}: {}", external_id, e),
        }
    }

    async fn list_raw(&self, filter: Option<&str>) -> Result<Vec<MultiplexerSessionInfo>, BackendError> {
        let mut args = vec!["-ls"];
        if let Some(filter) = filter {
            args.push(filter);
        }
        // `screen -ls` exits non-zero even when it lists sessions
        let output = self.screen.run(&args).await?;
        Ok(parse_screen_ls(&output.stdout))
    }
}

impl Default for ScreenBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBackend for ScreenBackend {
    fn multiplexer_type(&self) -> MultiplexerType {
        MultiplexerType::Screen
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::CAPABILITIES
    }

    fn is_available(&self) -> bool {
        self.screen.is_located()
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.screen.locate()?;
        let version = self.screen.run(&["-v"]).await?;
        tracing::info!("screen backend ready ({})", version.stdout.trim());
        Ok(())
    }

    async fn create_session(
        &self,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| default_name(&config.session_id));
        Self::validate_name(&name)?;
        self.screen.path()?;

        let mut args: Vec<String> = vec!["-dmS".into(), name.clone()];
        if let Some(shell) = &config.shell {
            args.push(shell.program.to_string_lossy().into_owned());
            args.extend(shell.args.iter().cloned());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        // -dmS has no directory flag; the detached shell inherits ours
        self.screen
            .run_checked_in(&args, &config.env, config.working_dir.as_deref())
            .await?;

        // Resolve the full `pid.name` id so later commands hit exactly this session
        let external_id = self
            .list_raw(Some(&name))
            .await?
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.external_id)
            .unwrap_or_else(|| name.clone());
        tracing::info!(
            "Created screen session {} for {}",
            external_id,
            config.session_id
        );

        match self.attach_client(&external_id, config, true) {
            Ok(pid) => Ok(BackendSession {
                external_id: Some(external_id),
                pid,
            }),
            Err(e) => {
                self.quit_external(&external_id).await;
                Err(e)
            }
        }
    }

    async fn attach_session(
        &self,
        external_id: &str,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        Self::validate_external_id(external_id)?;

        let exists = self
            .list_raw(Some(external_id))
            .await?
            .iter()
            .any(|s| s.external_id == external_id || s.name == external_id);
        if !exists {
            return Err(BackendError::NotFound(external_id.to_string()));
        }

        let pid = self.attach_client(external_id, config, config.owned)?;
        tracing::info!(
            "Attached {} to screen session {}",
            config.session_id,
            external_id
        );
        Ok(BackendSession {
            external_id: Some(external_id.to_string()),
            pid,
        })
    }

    async fn list_sessions(&self) -> Result<Vec<MultiplexerSessionInfo>, BackendError> {
        self.list_raw(None).await
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
        let external = self.names.release(session_id);
        let client = self.pool.terminate(session_id).await;

        match external {
            Some(external) if external.owned => {
                self.quit_external(&external.id).await;
                Ok(())
            }
            Some(external) => {
                tracing::info!("Detached from screen session {}, leaving it running", external.id);
                Ok(())
            }
            None => client.map(|_| ()),
        }
    }

    fn has_session(&self, session_id: &str) -> bool {
        self.pool.contains(session_id)
    }

    fn exit_status(&self, session_id: &str) -> Option<i32> {
        self.pool.exit_status(session_id)
    }

    async fn shutdown(&self) {
        self.pool.terminate_all().await;
        self.names.clear();
    }
}

/// Parse `screen -ls` output.
///
/// Session lines look like
/// `\t12345.work\t(01/02/24 10:00:00)\t(Detached)`; the date column is
/// optional and its format varies between builds.
fn parse_screen_ls(stdout: &str) -> Vec<MultiplexerSessionInfo> {
    stdout.lines().filter_map(parse_screen_line).collect()
}

fn parse_screen_line(line: &str) -> Option<MultiplexerSessionInfo> {
    let line = line.trim();
    let (external_id, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let (pid, name) = external_id.split_once('.')?;
    if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) || name.is_empty() {
        return None;
    }

    let groups: Vec<&str> = rest
        .split('(')
        .filter_map(|part| part.split_once(')').map(|(inside, _)| inside.trim()))
        .collect();
    let status = groups.last().copied().unwrap_or_default();
    let lowered = status.to_ascii_lowercase();
    let attached = lowered.contains("attached") && !lowered.contains("detached");

    let mut metadata = HashMap::new();
    metadata.insert("pid".to_string(), pid.to_string());
    metadata.insert("status".to_string(), status.to_string());
    if groups.len() > 1 {
        metadata.insert("created".to_string(), groups[0].to_string());
    }

    Some(MultiplexerSessionInfo {
        external_id: external_id.to_string(),
        name: name.to_string(),
        attached,
        columns: 0,
        rows: 0,
        window_count: 0,
        created_at: 0,
        metadata,
    })
}
