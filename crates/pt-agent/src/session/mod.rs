//! Session management

mod cleanup;
mod output;
mod registry;
mod service;

pub use cleanup::run_expiry_sweep;
pub use output::{OutputRouter, SessionExit, READ_CHUNK_SIZE, REPLAY_LIMIT};
pub use registry::{
    CreateOutcome, PersistedSession, RegistryLimits, RegistrySnapshot, RegistryStatistics,
    SessionConfig, SessionRegistry, TerminalSession, SNAPSHOT_VERSION,
};
pub use service::{control_frames, SessionService, EXTERNAL_ID_KEY, PID_KEY};
