//! Core trait definitions

mod backend;

pub use backend::{BackendSession, BackendSessionConfig, TerminalBackend};
