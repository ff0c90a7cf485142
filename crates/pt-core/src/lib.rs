//! pt-core: Core abstractions and configuration for pocket-terminal
//!
//! This crate provides the error taxonomy, agent configuration, shell
//! detection and the terminal-backend trait shared by the agent's
//! registry, backends and server.

pub mod config;
pub mod error;
pub mod shell;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{AgentError, BackendError, ConfigError, RegistryError, ShellError};
pub use shell::{ShellCommand, ShellDetector, ShellInfo, ShellPolicy, ShellType};
pub use traits::{BackendSession, BackendSessionConfig, TerminalBackend};
pub use types::ConnectionId;
