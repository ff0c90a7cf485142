//! Pseudo-terminal process pool

mod manager;

pub use manager::{PtyPool, SpawnSpec, TERMINATE_GRACE};
