//! pt-agent: Desktop agent for pocket-terminal
//!
//! The agent accepts client connections, keeps a registry of terminal
//! sessions backed by a native PTY, tmux or screen, and streams session
//! I/O as multiplexed frames.

pub mod backend;
pub mod clipboard;
pub mod pty;
pub mod server;
pub mod session;
pub mod state;

pub use state::AgentState;
