//! Session identifier types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire identifier for a terminal session
///
/// This is the 4-byte id carried in every frame header. The agent's registry
/// keys sessions by an opaque string and assigns each one a wire id for
/// binary routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the control sentinel
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }

    /// Special session ID for control messages (not bound to a session)
    pub const CONTROL: SessionId = SessionId(0);
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire-{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a registry session
///
/// `Created → Active → Disconnected → Terminated`. `Disconnected` is the
/// only state from which `Active` can be reached again (by reconnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Registered, backend process not yet confirmed
    Created,
    /// Bound to a live connection
    Active,
    /// Owning connection went away; eligible for reconnection
    Disconnected,
    /// Finished
    Terminated,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Active => 1,
            SessionState::Disconnected => 2,
            SessionState::Terminated => 3,
        }
    }

    /// Whether a plain state update may move from `self` to `next`.
    ///
    /// Updates only move forward; re-asserting the current state refreshes
    /// activity. `Disconnected → Active` is reserved for reconnection and is
    /// rejected here, as is anything leaving `Terminated`.
    pub fn can_update_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Terminated, _) => false,
            (current, next) if current == &next => true,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Active => write!(f, "active"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new(42);
        assert_eq!(format!("{}", id), "wire-42");
    }

    #[test]
    fn test_session_id_equality() {
        let id1 = SessionId::new(1);
        let id2 = SessionId::new(1);
        let id3 = SessionId::new(2);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert!(SessionId::new(0).is_control());
    }

    #[test]
    fn test_forward_transitions() {
        use SessionState::*;
        assert!(Created.can_update_to(Active));
        assert!(Active.can_update_to(Disconnected));
        assert!(Disconnected.can_update_to(Terminated));
        assert!(Active.can_update_to(Active));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use SessionState::*;
        assert!(!Active.can_update_to(Created));
        assert!(!Disconnected.can_update_to(Active));
        assert!(!Terminated.can_update_to(Active));
        assert!(!Terminated.can_update_to(Terminated));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&SessionState::Disconnected).unwrap();
        assert_eq!(json, "\"DISCONNECTED\"");
    }
}
