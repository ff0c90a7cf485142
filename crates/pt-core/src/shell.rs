//! Shell discovery and validation
//!
//! Enumerates the shells installed on the host, picks a default, and checks
//! requested shells against an optional allow-list before a backend spawns
//! anything.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::ShellError;

/// Directories searched for Unix shells
#[cfg(unix)]
const UNIX_SHELL_DIRS: &[&str] = &["/bin", "/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

/// Shell names recognised on Unix, in preference order
const UNIX_SHELL_NAMES: &[&str] = &["sh", "bash", "zsh", "fish"];

/// Shell family, inferred from the executable name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    Sh,
    Bash,
    Zsh,
    Fish,
    Cmd,
    PowerShell,
    Pwsh,
}

impl ShellType {
    /// Classify a shell by its executable name. Unknown names yield `None`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
        match stem.as_str() {
            "sh" => Some(Self::Sh),
            "bash" => Some(Self::Bash),
            "zsh" => Some(Self::Zsh),
            "fish" => Some(Self::Fish),
            "cmd" => Some(Self::Cmd),
            "powershell" => Some(Self::PowerShell),
            "pwsh" => Some(Self::Pwsh),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> ShellCapabilities {
        match self {
            Self::Sh => ShellCapabilities {
                colors: false,
                job_control: true,
                completion: false,
            },
            Self::Bash | Self::Zsh | Self::Fish => ShellCapabilities {
                colors: true,
                job_control: true,
                completion: true,
            },
            Self::Cmd => ShellCapabilities::default(),
            Self::PowerShell | Self::Pwsh => ShellCapabilities {
                colors: true,
                job_control: false,
                completion: true,
            },
        }
    }

    /// Argument that starts this shell as a login shell
    pub fn login_flag(&self) -> Option<&'static str> {
        match self {
            Self::Sh | Self::Bash | Self::Zsh | Self::Fish => Some("-l"),
            Self::Cmd | Self::PowerShell | Self::Pwsh => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Fish => "fish",
            Self::Cmd => "cmd",
            Self::PowerShell => "powershell",
            Self::Pwsh => "pwsh",
        }
    }
}

impl fmt::Display for ShellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a shell can do for an interactive client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCapabilities {
    pub colors: bool,
    pub job_control: bool,
    pub completion: bool,
}

/// A discovered shell executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellInfo {
    pub path: PathBuf,
    pub shell_type: ShellType,
    pub capabilities: ShellCapabilities,
    pub is_default: bool,
}

impl ShellInfo {
    fn new(path: PathBuf, shell_type: ShellType, is_default: bool) -> Self {
        Self {
            path,
            shell_type,
            capabilities: shell_type.capabilities(),
            is_default,
        }
    }
}

/// Program and arguments used to start a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Allow-list and argument policy applied to shells
#[derive(Debug, Clone, Default)]
pub struct ShellPolicy {
    pub allowed_shells: Vec<PathBuf>,
    pub shell_args: HashMap<String, Vec<String>>,
    pub login_shell: bool,
}

impl From<&AgentConfig> for ShellPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            allowed_shells: config.allowed_shells.clone(),
            shell_args: config.shell_args.clone(),
            login_shell: config.login_shell,
        }
    }
}

/// Platform-aware shell discovery and validation
#[derive(Debug, Clone)]
pub struct ShellDetector {
    policy: ShellPolicy,
    /// Canonical forms of `policy.allowed_shells`
    allowed: HashSet<PathBuf>,
}

impl ShellDetector {
    pub fn new(policy: ShellPolicy) -> Self {
        let allowed = policy
            .allowed_shells
            .iter()
            .map(|p| canonical(p).unwrap_or_else(|| p.clone()))
            .collect();
        Self { policy, allowed }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(ShellPolicy::from(config))
    }

    pub fn policy(&self) -> &ShellPolicy {
        &self.policy
    }

    /// Shells installed on this host.
    ///
    /// Candidates are probed as the iterator is consumed. Entries are
    /// de-duplicated by canonical path, so `/bin/bash` and a `/usr/bin/bash`
    /// symlink to it appear once.
    pub fn detect_shells(&self) -> impl Iterator<Item = ShellInfo> {
        let default = self.default_shell().ok().map(|s| s.path);
        let mut seen = HashSet::new();

        platform_candidates().into_iter().filter_map(move |path| {
            let shell_type = ShellType::from_path(&path)?;
            if !is_executable(&path) {
                return None;
            }
            let key = canonical(&path).unwrap_or_else(|| path.clone());
            if !seen.insert(key.clone()) {
                return None;
            }
            let is_default = default
                .as_ref()
                .map(|d| canonical(d).as_ref() == Some(&key))
                .unwrap_or(false);
            Some(ShellInfo::new(path, shell_type, is_default))
        })
    }

    /// The single default shell for new sessions.
    ///
    /// On Unix this is `$SHELL` when it points at an executable, falling back
    /// to `/bin/sh` and then the first detected shell. On Windows it is
    /// PowerShell when installed, else `cmd`.
    pub fn default_shell(&self) -> Result<ShellInfo, ShellError> {
        let path = platform_default().ok_or(ShellError::NoShellAvailable)?;
        // Unknown login shells (e.g. nu) still work; classify them as sh.
        let shell_type = ShellType::from_path(&path).unwrap_or(ShellType::Sh);
        debug!(shell = %path.display(), %shell_type, "Resolved default shell");
        Ok(ShellInfo::new(path, shell_type, true))
    }

    /// Check that `path` exists, is executable and, when an allow-list is
    /// configured, canonically matches an allowed shell.
    ///
    /// Returns `path` unchanged on success; the canonical form is only used
    /// for the allow-list check, so argument policies and the spawned
    /// program still see the path the caller named.
    pub fn validate_shell(&self, path: &Path) -> Result<PathBuf, ShellError> {
        let resolved = canonical(path).ok_or_else(|| ShellError::NotFound(path.to_path_buf()))?;

        if !is_executable(&resolved) {
            return Err(ShellError::NotExecutable(path.to_path_buf()));
        }

        if !self.allowed.is_empty() && !self.allowed.contains(&resolved) {
            warn!(shell = %path.display(), resolved = %resolved.display(), "Shell rejected by allow-list");
            return Err(ShellError::NotAllowed(path.to_path_buf()));
        }

        Ok(path.to_path_buf())
    }

    /// Arguments for `path`: the per-shell policy (full path first, then
    /// executable name), preceded by the login flag when configured.
    pub fn shell_args(&self, path: &Path) -> Vec<String> {
        let mut args = self
            .policy
            .shell_args
            .get(path.to_string_lossy().as_ref())
            .or_else(|| {
                let name = path.file_name()?.to_str()?;
                self.policy.shell_args.get(name)
            })
            .cloned()
            .unwrap_or_default();

        if self.policy.login_shell {
            if let Some(flag) = ShellType::from_path(path).and_then(|t| t.login_flag()) {
                if !args.iter().any(|a| a == flag) {
                    args.insert(0, flag.to_string());
                }
            }
        }

        args
    }

    pub fn shell_command(&self, path: &Path) -> ShellCommand {
        ShellCommand {
            program: path.to_path_buf(),
            args: self.shell_args(path),
        }
    }
}

fn canonical(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(unix)]
fn platform_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = UNIX_SHELL_NAMES
        .iter()
        .flat_map(|name| UNIX_SHELL_DIRS.iter().map(move |dir| Path::new(dir).join(name)))
        .collect();

    // Shells registered by the administrator, limited to known families
    if let Ok(contents) = std::fs::read_to_string("/etc/shells") {
        candidates.extend(parse_etc_shells(&contents));
    }

    candidates
}

#[cfg(windows)]
fn platform_candidates() -> Vec<PathBuf> {
    let system_root = std::env::var_os("SystemRoot")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
    let system32 = system_root.join("System32");

    let mut candidates = vec![
        system32.join("cmd.exe"),
        system32
            .join("WindowsPowerShell")
            .join("v1.0")
            .join("powershell.exe"),
    ];
    if let Ok(pwsh) = which::which("pwsh") {
        candidates.push(pwsh);
    }
    if let Some(program_files) = std::env::var_os("ProgramFiles") {
        candidates.push(
            PathBuf::from(program_files)
                .join("PowerShell")
                .join("7")
                .join("pwsh.exe"),
        );
    }
    candidates
}

#[cfg(not(any(unix, windows)))]
fn platform_candidates() -> Vec<PathBuf> {
    vec![]
}

/// Entries of an `/etc/shells` file whose executable is a known Unix shell
fn parse_etc_shells(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| UNIX_SHELL_NAMES.contains(&n))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(unix)]
fn platform_default() -> Option<PathBuf> {
    if let Some(shell) = std::env::var_os("SHELL").map(PathBuf::from) {
        if is_executable(&shell) {
            return Some(shell);
        }
        debug!(shell = %shell.display(), "SHELL is not executable, falling back");
    }

    let fallback = PathBuf::from("/bin/sh");
    if is_executable(&fallback) {
        return Some(fallback);
    }

    if let Some(found) = UNIX_SHELL_NAMES.iter().find_map(|name| which::which(name).ok()) {
        return Some(found);
    }

    platform_candidates()
        .into_iter()
        .find(|p| ShellType::from_path(p).is_some() && is_executable(p))
}

#[cfg(windows)]
fn platform_default() -> Option<PathBuf> {
    let candidates = platform_candidates();
    candidates
        .iter()
        .find(|p| {
            matches!(
                ShellType::from_path(p),
                Some(ShellType::PowerShell) | Some(ShellType::Pwsh)
            ) && is_executable(p)
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|p| ShellType::from_path(p) == Some(ShellType::Cmd))
        })
        .cloned()
}

#[cfg(not(any(unix, windows)))]
fn platform_default() -> Option<PathBuf> {
    None
}
