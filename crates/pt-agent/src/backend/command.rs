//! Running multiplexer executables

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Command;

use pt_core::BackendError;
use pt_protocol::MultiplexerType;

/// Upper bound for one multiplexer invocation
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Path of a multiplexer executable, resolved by `initialize()`
#[derive(Debug)]
pub struct Executable {
    multiplexer: MultiplexerType,
    name: &'static str,
    path: OnceLock<PathBuf>,
}

impl Executable {
    pub fn new(multiplexer: MultiplexerType, name: &'static str) -> Self {
        Self {
            multiplexer,
            name,
            path: OnceLock::new(),
        }
    }

    /// Look the executable up on `PATH`
    pub fn locate(&self) -> Result<&Path, BackendError> {
        if let Some(path) = self.path.get() {
            return Ok(path);
        }
        let found = which::which(self.name).map_err(|e| {
            tracing::debug!("{} not found on PATH: {}", self.name, e);
            BackendError::Unavailable(self.multiplexer)
        })?;
        tracing::info!("Using {} at {}", self.name, found.display());
        Ok(self.path.get_or_init(|| found))
    }

    /// Resolved path; fails fast when `locate()` has not succeeded
    pub fn path(&self) -> Result<&Path, BackendError> {
        self.path
            .get()
            .map(PathBuf::as_path)
            .ok_or(BackendError::NotInitialized(self.multiplexer))
    }

    pub fn is_located(&self) -> bool {
        self.path.get().is_some()
    }

    /// Run the executable with `args` and capture its output
    pub async fn run(&self, args: &[&str]) -> Result<CommandOutput, BackendError> {
        self.run_env(args, &[]).await
    }

    /// Run with extra environment variables
    pub async fn run_env(
        &self,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<CommandOutput, BackendError> {
        let program = self.path()?;
        run_command(program, args, env, None, COMMAND_TIMEOUT).await
    }

    /// Run and require a zero exit status
    pub async fn run_checked(&self, args: &[&str]) -> Result<String, BackendError> {
        self.run_checked_env(args, &[]).await
    }

    pub async fn run_checked_env(
        &self,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<String, BackendError> {
        self.run_checked_in(args, env, None).await
    }

    /// Run in `cwd` and require a zero exit status
    pub async fn run_checked_in(
        &self,
        args: &[&str],
        env: &[(String, String)],
        cwd: Option<&Path>,
    ) -> Result<String, BackendError> {
        let program = self.path()?;
        let output = run_command(program, args, env, cwd, COMMAND_TIMEOUT).await?;
        if !output.success {
            return Err(BackendError::Command {
                command: format!("{} {}", self.name, args.join(" ")),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

pub async fn run_command(
    program: &Path,
    args: &[&str],
    env: &[(String, String)],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, BackendError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let command = || format!("{} {}", program.display(), args.join(" "));
    tracing::debug!("Running {}", command());

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| BackendError::Timeout {
            command: command(),
            after: timeout,
        })??;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// External multiplexer session carried by a registry session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSession {
    pub id: String,
    /// Ending the registry session also ends this one. False for sessions
    /// the user started and the agent only joined.
    pub owned: bool,
}

/// Registry session id to external session
#[derive(Debug, Default)]
pub struct ExternalSessions {
    map: DashMap<String, ExternalSession>,
}

impl ExternalSessions {
    pub fn track(&self, session_id: &str, external_id: &str, owned: bool) {
        self.map.insert(
            session_id.to_string(),
            ExternalSession {
                id: external_id.to_string(),
                owned,
            },
        );
    }

    pub fn release(&self, session_id: &str) -> Option<ExternalSession> {
        self.map.remove(session_id).map(|(_, external)| external)
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Reject names a multiplexer would misinterpret
pub fn validate_name(name: &str, forbidden: &[char]) -> Result<(), BackendError> {
    let reason = if name.is_empty() {
        Some("must not be empty".to_string())
    } else if name.chars().count() > pt_protocol::limits::MAX_SESSION_ID_LEN {
        Some("longer than 256 characters".to_string())
    } else if let Some(c) = name.chars().find(|c| forbidden.contains(c)) {
        Some(format!("contains {:?}", c))
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some("contains whitespace or control characters".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(BackendError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Agent-chosen external session name for a registry session
pub fn default_name(session_id: &str) -> String {
    let short: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    format!("pt-{}", short)
}

/// Shell script standing in for a multiplexer; each invocation appends its
/// arguments as one line to the returned log file
#[cfg(all(test, unix))]
pub(crate) fn recording_executable(
    dir: &Path,
    multiplexer: MultiplexerType,
    name: &'static str,
) -> (Executable, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join(format!("{}.log", name));
    let script = dir.join(name);
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" >> '{}'\n", log.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let exe = Executable::new(multiplexer, name);
    exe.path.set(script).unwrap();
    (exe, log)
}
