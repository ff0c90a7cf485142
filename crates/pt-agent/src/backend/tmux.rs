//! tmux-backed sessions
//!
//! Sessions are created detached with `tmux new-session -d`, and the agent
//! attaches a `tmux attach-session` client inside a PTY to carry the I/O.
//! The tmux session outlives the client, so it survives agent restarts.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;

use pt_core::{BackendError, BackendSession, BackendSessionConfig, TerminalBackend};
use pt_protocol::{BackendCapabilities, MultiplexerSessionInfo, MultiplexerType, TerminalSize};

use super::command::{default_name, validate_name, Executable, ExternalSessions};
use crate::pty::{PtyPool, SpawnSpec};

/// Characters tmux treats as target separators
const FORBIDDEN_NAME_CHARS: &[char] = &[':', '.'];

/// `list-sessions` format; fields are `:`-separated since names cannot
/// contain `:`
const LIST_FORMAT: &str = "#{session_name}:#{session_id}:#{session_attached}:#{session_width}:#{session_height}:#{session_windows}:#{session_created}";

/// stderr fragments that mean "there are no sessions"
const NO_SESSIONS_MARKERS: &[&str] = &[
    "no server running",
    "no sessions",
    "error connecting to",
    "No such file or directory",
];

pub struct TmuxBackend {
    tmux: Executable,
    pool: PtyPool,
    /// Registry session id to tmux session name
    names: ExternalSessions,
}

impl TmuxBackend {
    pub const CAPABILITIES: BackendCapabilities = BackendCapabilities {
        attach: true,
        persistence: true,
        multi_pane: true,
        sharing: true,
        copy_mode: true,
    };

    pub fn new() -> Self {
        Self::with_executable(Executable::new(MultiplexerType::Tmux, "tmux"))
    }

    fn with_executable(tmux: Executable) -> Self {
        Self {
            tmux,
            pool: PtyPool::new(),
            names: ExternalSessions::default(),
        }
    }

    pub fn validate_name(name: &str) -> Result<(), BackendError> {
        validate_name(name, FORBIDDEN_NAME_CHARS)
    }

    /// Exact-match target, so `work` never resolves to `work2`
    fn target(name: &str) -> String {
        format!("={}", name)
    }

    fn attach_client(
        &self,
        name: &str,
        config: &BackendSessionConfig,
        owned: bool,
    ) -> Result<Option<u32>, BackendError> {
        let program = self.tmux.path()?.to_path_buf();
        let mut spec = SpawnSpec::new(program, config.size).args([
            "attach-session".to_string(),
            "-t".to_string(),
            Self::target(name),
        ]);
        spec.working_dir = config.working_dir.clone();
        spec.env = config.env.clone();

        let pid = self.pool.spawn(&config.session_id, spec)?;
        self.names.track(&config.session_id, name, owned);
        Ok(pid)
    }

    async fn kill_external(&self, name: &str) {
        let target = Self::target(name);
        match self.tmux.run(&["kill-session", "-t", &target]).await {
            Ok(output) if !output.success => {
                tracing::debug!("tmux kill-session {}: {}", name, output.stderr.trim());
            }
            Ok(_) => tracing::info!("Killed tmux session {}", name),
            Err(e) => tracing::warn!("Failed to kill tmux session {}: {}", name, e),
        }
    }
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    fn multiplexer_type(&self) -> MultiplexerType {
        MultiplexerType::Tmux
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::CAPABILITIES
    }

    fn is_available(&self) -> bool {
        self.tmux.is_located()
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.tmux.locate()?;
        let version = self.tmux.run_checked(&["-V"]).await?;
        tracing::info!("tmux backend ready ({})", version.trim());
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
        self.tmux.path()?;

        let columns = config.size.columns.to_string();
        let rows = config.size.rows.to_string();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.clone(),
            "-x".into(),
            columns,
            "-y".into(),
            rows,
        ];
        if let Some(dir) = &config.working_dir {
            args.push("-c".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(shell) = &config.shell {
            args.push(shell.program.to_string_lossy().into_owned());
            args.extend(shell.args.iter().cloned());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tmux.run_checked(&args).await?;
        tracing::info!("Created tmux session {} for {}", name, config.session_id);

        match self.attach_client(&name, config, true) {
            Ok(pid) => Ok(BackendSession {
                external_id: Some(name),
                pid,
            }),
            Err(e) => {
                self.kill_external(&name).await;
                Err(e)
            }
        }
    }

    async fn attach_session(
        &self,
        external_id: &str,
        config: &BackendSessionConfig,
    ) -> Result<BackendSession, BackendError> {
        Self::validate_name(external_id)?;

        let target = Self::target(external_id);
        let output = self.tmux.run(&["has-session", "-t", &target]).await?;
        if !output.success {
            return Err(BackendError::NotFound(external_id.to_string()));
        }

        let pid = self.attach_client(external_id, config, config.owned)?;
        tracing::info!(
            "Attached {} to tmux session {}",
            config.session_id,
            external_id
        );
        Ok(BackendSession {
            external_id: Some(external_id.to_string()),
            pid,
        })
    }

    async fn list_sessions(&self) -> Result<Vec<MultiplexerSessionInfo>, BackendError> {
        let output = self.tmux.run(&["list-sessions", "-F", LIST_FORMAT]).await?;
        if !output.success {
            if NO_SESSIONS_MARKERS
                .iter()
                .any(|marker| output.stderr.contains(marker))
            {
                return Ok(vec![]);
            }
            return Err(BackendError::Command {
                command: "tmux list-sessions".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_list_sessions(&output.stdout))
    }

    async fn write_input(&self, session_id: &str, data: &[u8]) -> Result<(), BackendError> {
        self.pool.write(session_id, data).await
    }

    fn take_output(&self, session_id: &str) -> Result<Box<dyn Read + Send>, BackendError> {
        self.pool.take_reader(session_id)
    }

    async fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), BackendError> {
        // tmux follows the attached client's PTY size
        self.pool.resize(session_id, size)
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), BackendError> {
        let external = self.names.release(session_id);
        let client = self.pool.terminate(session_id).await;

        match external {
            Some(external) if external.owned => {
                self.kill_external(&external.id).await;
                Ok(())
            }
            Some(external) => {
                tracing::info!("Detached from tmux session {}, leaving it running", external.id);
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
        // Detach clients only; the tmux sessions stay for a later re-attach
        self.pool.terminate_all().await;
        self.names.clear();
    }
}

/// Parse `list-sessions` output produced with [`LIST_FORMAT`]
fn parse_list_sessions(stdout: &str) -> Vec<MultiplexerSessionInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_session_line(line);
            if parsed.is_none() {
                tracing::warn!("Skipping unparseable tmux session line: {:?}", line);
            }
            parsed
        })
        .collect()
}

fn parse_session_line(line: &str) -> Option<MultiplexerSessionInfo> {
    let fields: Vec<&str> = line.trim_end().split(':').collect();
    let [name, id, attached, width, height, windows, created] = fields.as_slice() else {
        return None;
    };

    let mut metadata = HashMap::new();
    metadata.insert("session_id".to_string(), id.to_string());

    Some(MultiplexerSessionInfo {
        external_id: name.to_string(),
        name: name.to_string(),
        attached: attached.parse::<u32>().ok()? > 0,
        columns: width.parse().unwrap_or(0),
        rows: height.parse().unwrap_or(0),
        window_count: windows.parse().unwrap_or(0),
        created_at: created.parse().unwrap_or(0),
        metadata,
    })
}
