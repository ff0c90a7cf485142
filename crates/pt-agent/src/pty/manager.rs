//! PTY process management
//!
//! Owns the pseudo-terminal processes behind sessions, keyed by registry
//! session id. Every backend spawns through a pool: the native backend runs
//! the shell directly, the multiplexer backends run their attach client.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use pt_core::BackendError;
use pt_protocol::TerminalSize;

/// How long a terminated process gets to exit before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a terminated process
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run inside a new PTY
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub size: TerminalSize,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>, size: TerminalSize) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            size,
            working_dir: None,
            env: vec![],
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A running process attached to a PTY
struct PtyProcess {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    /// Shared so a blocked write never holds the pool entry
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Set once the process has been reaped
    exit_code: Option<i32>,
}

impl PtyProcess {
    fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.exit_code() as i32);
            }
        }
        self.exit_code
    }

    /// Ask the process to exit, killing it after `grace`. Blocks.
    fn shutdown(mut self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.poll_exit() {
            return Some(code);
        }

        if self.pid.map(signal_terminate).unwrap_or(false) {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if let Some(code) = self.poll_exit() {
                    return Some(code);
                }
                std::thread::sleep(EXIT_POLL_INTERVAL);
            }
            tracing::debug!(pid = ?self.pid, "Process ignored SIGTERM, killing");
        }

        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(_) => None,
        }
        // master and writer drop here, closing the PTY
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}

fn lock(process: &Mutex<PtyProcess>) -> std::sync::MutexGuard<'_, PtyProcess> {
    process.lock().unwrap_or_else(PoisonError::into_inner)
}

/// PTY processes keyed by session id
#[derive(Default)]
pub struct PtyPool {
    processes: DashMap<String, Mutex<PtyProcess>>,
}

impl PtyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `spec` in a fresh PTY and register it under `session_id`
    pub fn spawn(&self, session_id: &str, spec: SpawnSpec) -> Result<Option<u32>, BackendError> {
        tracing::info!(
            "Spawning {} for session {} at {}x{}",
            spec.program.display(),
            session_id,
            spec.size.columns,
            spec.size.rows
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(spec.size))
            .map_err(|e| BackendError::Spawn(format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Spawn(format!("{}: {}", spec.program.display(), e)))?;
        // The child holds its own slave handle
        drop(pair.slave);

        let pid = child.process_id();
        tracing::debug!("Spawned process with PID {:?} for session {}", pid, session_id);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Spawn(format!("failed to take PTY writer: {}", e)))?;

        let process = PtyProcess {
            pid,
            master: pair.master,
            child,
            writer: Arc::new(Mutex::new(writer)),
            exit_code: None,
        };

        if let Some(previous) = self
            .processes
            .insert(session_id.to_string(), Mutex::new(process))
        {
            // Replaced a stale handle; make sure it does not linger
            let previous = previous.into_inner().unwrap_or_else(PoisonError::into_inner);
            std::thread::spawn(move || previous.shutdown(Duration::ZERO));
        }

        Ok(pid)
    }

    /// Write data to a session's PTY.
    ///
    /// The write runs on a blocking thread, since a child that stops
    /// reading leaves it stuck until the PTY buffer drains.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), BackendError> {
        let writer = {
            let entry = self
                .processes
                .get(session_id)
                .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
            let process = lock(&entry);
            Arc::clone(&process.writer)
        };
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| BackendError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// A blocking reader over the session's output
    pub fn take_reader(&self, session_id: &str) -> Result<Box<dyn Read + Send>, BackendError> {
        let entry = self
            .processes
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        let process = lock(&entry);
        process
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Spawn(format!("failed to clone PTY reader: {}", e)))
    }

    pub fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), BackendError> {
        let entry = self
            .processes
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        tracing::debug!("Resizing session {} to {}x{}", session_id, size.columns, size.rows);
        let process = lock(&entry);
        process
            .master
            .resize(pty_size(size))
            .map_err(|e| BackendError::Command {
                command: "resize".to_string(),
                message: e.to_string(),
            })
    }

    /// Exit code if the process has finished
    pub fn exit_status(&self, session_id: &str) -> Option<i32> {
        let entry = self.processes.get(session_id)?;
        let mut process = lock(&entry);
        process.poll_exit()
    }

    pub fn pid(&self, session_id: &str) -> Option<u32> {
        let entry = self.processes.get(session_id)?;
        let pid = lock(&entry).pid;
        pid
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.processes.contains_key(session_id)
    }

    /// Stop a session's process: SIGTERM, then kill after [`TERMINATE_GRACE`]
    pub async fn terminate(&self, session_id: &str) -> Result<Option<i32>, BackendError> {
        let (_, process) = self
            .processes
            .remove(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        let process = process.into_inner().unwrap_or_else(PoisonError::into_inner);

        tracing::info!("Terminating PTY process for session {}", session_id);
        let exit_code = tokio::task::spawn_blocking(move || process.shutdown(TERMINATE_GRACE))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e)))?;
        Ok(exit_code)
    }

    /// Terminate every process in the pool
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = self.session_ids();
        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                tracing::debug!("Process for session {} already gone: {}", id, e);
            }
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.processes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.columns,
        pixel_width: 0,
        pixel_height: 0,
    }
}
