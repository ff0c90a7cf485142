//! Session registry
//!
//! The authoritative record of which sessions exist, who owns them and what
//! state they are in. Backends keep the processes; the registry decides
//! existence.
//!
//! The primary map, the connection index and the wire-id index are only
//! mutated while holding `write_lock`, so no reader ever sees a session in
//! one index but not another. Reads go straight to the concurrent maps and
//! may be slightly stale.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pt_core::config::AgentConfig;
use pt_core::time::{current_time_millis, cutoff_millis};
use pt_core::{ConnectionId, RegistryError};
use pt_protocol::{
    CreateSessionRequest, MultiplexerType, SessionId, SessionState, SessionSummary, TerminalSize,
};

/// Version of the exported state format
pub const SNAPSHOT_VERSION: u32 = 1;

/// Creation parameters kept with a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub shell: Option<String>,
    pub columns: u16,
    pub rows: u16,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub enable_reconnection: bool,
    pub multiplexer: MultiplexerType,
}

impl SessionConfig {
    /// Build from a validated request, falling back to `default_multiplexer`
    pub fn from_request(request: &CreateSessionRequest, default_multiplexer: MultiplexerType) -> Self {
        Self {
            shell: request.shell.clone(),
            columns: request.columns,
            rows: request.rows,
            working_dir: request.working_dir.clone(),
            env: request.env.clone(),
            enable_reconnection: request.enable_reconnection,
            multiplexer: request.multiplexer.unwrap_or(default_multiplexer),
        }
    }

    pub fn new(size: TerminalSize, multiplexer: MultiplexerType) -> Self {
        Self {
            shell: None,
            columns: size.columns,
            rows: size.rows,
            working_dir: None,
            env: HashMap::new(),
            enable_reconnection: true,
            multiplexer,
        }
    }

    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.columns, self.rows).unwrap_or_default()
    }
}

/// A registry session
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSession {
    pub id: String,
    /// Id carried in binary frame headers
    pub wire_id: SessionId,
    pub connection_id: ConnectionId,
    pub state: SessionState,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis
    pub last_activity_at: u64,
    pub config: SessionConfig,
    pub reconnect_count: u32,
    pub metadata: HashMap<String, String>,
}

impl TerminalSession {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            wire_id: self.wire_id.as_u32(),
            state: self.state,
            shell: self.config.shell.clone(),
            columns: self.config.columns,
            rows: self.config.rows,
            multiplexer: self.config.multiplexer,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            reconnect_count: self.reconnect_count,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = current_time_millis();
    }
}

/// Result of a create call
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new session was registered
    Created(TerminalSession),
    /// The caller-supplied id already names a live session of this
    /// connection; nothing changed
    Existing(TerminalSession),
}

impl CreateOutcome {
    pub fn session(&self) -> &TerminalSession {
        match self {
            CreateOutcome::Created(session) | CreateOutcome::Existing(session) => session,
        }
    }

    pub fn into_session(self) -> TerminalSession {
        match self {
            CreateOutcome::Created(session) | CreateOutcome::Existing(session) => session,
        }
    }
}

/// Capacity limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_total_sessions: usize,
    pub max_sessions_per_connection: usize,
}

impl From<&AgentConfig> for RegistryLimits {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_total_sessions: config.max_total_sessions,
            max_sessions_per_connection: config.max_sessions_per_connection,
        }
    }
}

/// Point-in-time registry counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegistryStatistics {
    pub total_sessions: usize,
    pub created_sessions: usize,
    pub active_sessions: usize,
    pub disconnected_sessions: usize,
    /// Connections holding at least one session
    pub total_connections: usize,
    pub average_sessions_per_connection: f64,
}

/// A disconnected session as written to the state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: String,
    pub connection_id: ConnectionId,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub config: SessionConfig,
    pub reconnect_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Exported registry state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    pub exported_at: u64,
    pub sessions: Vec<PersistedSession>,
}

pub struct SessionRegistry {
    limits: RegistryLimits,
    sessions: DashMap<String, TerminalSession>,
    by_connection: DashMap<ConnectionId, HashSet<String>>,
    by_wire_id: DashMap<u32, String>,
    next_wire_id: AtomicU32,
    write_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            by_wire_id: DashMap::new(),
            next_wire_id: AtomicU32::new(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `CREATED` session owned by `connection_id`.
    ///
    /// A `requested_id` makes the call idempotent: retrying with the id of a
    /// live session this connection already owns returns that session.
    pub fn create_session(
        &self,
        connection_id: &ConnectionId,
        config: SessionConfig,
        requested_id: Option<String>,
    ) -> Result<CreateOutcome, RegistryError> {
        let _guard = self.lock();

        if let Some(id) = &requested_id {
            if let Some(existing) = self.sessions.get(id) {
                if &existing.connection_id == connection_id && !existing.state.is_terminal() {
                    tracing::debug!("Session {} already exists, returning it", id);
                    return Ok(CreateOutcome::Existing(existing.clone()));
                }
                return Err(RegistryError::AlreadyExists(id.clone()));
            }
        }

        if self.sessions.len() >= self.limits.max_total_sessions {
            tracing::warn!(
                "Rejecting session for {}: {} sessions at the global limit",
                connection_id,
                self.sessions.len()
            );
            return Err(RegistryError::SessionLimit {
                max: self.limits.max_total_sessions,
            });
        }

        let held = self.connection_session_count(connection_id, None);
        if held >= self.limits.max_sessions_per_connection {
            tracing::warn!(
                "Rejecting session for {}: connection holds {} sessions",
                connection_id,
                held
            );
            return Err(RegistryError::ConnectionSessionLimit {
                connection_id: connection_id.to_string(),
                max: self.limits.max_sessions_per_connection,
            });
        }

        let id = requested_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let wire_id = self.allocate_wire_id();
        let now = current_time_millis();
        let session = TerminalSession {
            id: id.clone(),
            wire_id,
            connection_id: connection_id.clone(),
            state: SessionState::Created,
            created_at: now,
            last_activity_at: now,
            config,
            reconnect_count: 0,
            metadata: HashMap::new(),
        };

        self.insert_locked(session.clone());
        tracing::info!(
            "Created session {} ({}) for connection {}",
            id,
            wire_id,
            connection_id
        );
        Ok(CreateOutcome::Created(session))
    }

    pub fn get_session(&self, id: &str) -> Option<TerminalSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn get_by_wire_id(&self, wire_id: SessionId) -> Option<TerminalSession> {
        let id = self.by_wire_id.get(&wire_id.as_u32()).map(|id| id.clone())?;
        self.get_session(&id)
    }

    pub fn get_sessions_for_connection(&self, connection_id: &ConnectionId) -> Vec<TerminalSession> {
        let ids: Vec<String> = match self.by_connection.get(connection_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return vec![],
        };
        ids.iter().filter_map(|id| self.get_session(id)).collect()
    }

    pub fn list_sessions(&self) -> Vec<TerminalSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Move a session to `state` and refresh its activity time.
    ///
    /// Returns false for unknown ids and for transitions the lifecycle does
    /// not allow (leaving `TERMINATED`, going backwards, or
    /// `DISCONNECTED → ACTIVE` outside [`Self::reconnect_session`]).
    pub fn update_session_state(&self, id: &str, state: SessionState) -> bool {
        let _guard = self.lock();
        let Some(mut session) = self.sessions.get_mut(id) else {
            return false;
        };
        if !session.state.can_update_to(state) {
            tracing::debug!(
                "Refusing state change of {} from {} to {}",
                id,
                session.state,
                state
            );
            return false;
        }
        if session.state != state {
            tracing::debug!("Session {}: {} -> {}", id, session.state, state);
        }
        session.state = state;
        session.touch();
        true
    }

    /// Refresh a session's activity time
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn set_metadata(&self, id: &str, key: impl Into<String>, value: impl Into<String>) -> bool {
        let _guard = self.lock();
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.metadata.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn update_geometry(&self, id: &str, size: TerminalSize) -> bool {
        let _guard = self.lock();
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.config.columns = size.columns;
                session.config.rows = size.rows;
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a session from every index. False if it was already gone.
    pub fn terminate_session(&self, id: &str, reason: &str) -> bool {
        self.take_session(id, reason).is_some()
    }

    /// Remove a session and hand back its final record
    pub fn take_session(&self, id: &str, reason: &str) -> Option<TerminalSession> {
        let _guard = self.lock();
        let mut session = self.remove_locked(id)?;
        session.state = SessionState::Terminated;
        tracing::info!("Terminated session {}: {}", id, reason);
        Some(session)
    }

    /// Remove every session owned by `connection_id`; returns how many
    pub fn terminate_connection_sessions(&self, connection_id: &ConnectionId, reason: &str) -> usize {
        self.drain_connection_sessions(connection_id, reason).len()
    }

    pub fn drain_connection_sessions(
        &self,
        connection_id: &ConnectionId,
        reason: &str,
    ) -> Vec<TerminalSession> {
        let _guard = self.lock();
        let ids: Vec<String> = match self.by_connection.get(connection_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return vec![],
        };

        let removed: Vec<TerminalSession> = ids
            .iter()
            .filter_map(|id| self.remove_locked(id))
            .map(|mut session| {
                session.state = SessionState::Terminated;
                session
            })
            .collect();
        if !removed.is_empty() {
            tracing::info!(
                "Terminated {} sessions of connection {}: {}",
                removed.len(),
                connection_id,
                reason
            );
        }
        removed
    }

    /// Keep a session for reconnection after its connection went away
    pub fn mark_disconnected(&self, id: &str) -> bool {
        self.update_session_state(id, SessionState::Disconnected)
    }

    /// Rebind a `DISCONNECTED` session to `new_connection`.
    ///
    /// Fails without changing anything if the session is unknown, not
    /// disconnected, created without reconnection, or if the new connection
    /// is at its session limit.
    pub fn reconnect_session(
        &self,
        id: &str,
        new_connection: &ConnectionId,
    ) -> Result<TerminalSession, RegistryError> {
        let _guard = self.lock();

        let current = self
            .get_session(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if current.state != SessionState::Disconnected {
            return Err(RegistryError::InvalidState {
                session_id: id.to_string(),
                state: current.state,
                expected: SessionState::Disconnected,
            });
        }
        if !current.config.enable_reconnection {
            return Err(RegistryError::NotReconnectable(id.to_string()));
        }

        let held = self.connection_session_count(new_connection, Some(id));
        if held >= self.limits.max_sessions_per_connection {
            return Err(RegistryError::ConnectionSessionLimit {
                connection_id: new_connection.to_string(),
                max: self.limits.max_sessions_per_connection,
            });
        }

        self.unindex_connection(&current.connection_id, id);
        self.by_connection
            .entry(new_connection.clone())
            .or_default()
            .insert(id.to_string());

        let updated = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            session.connection_id = new_connection.clone();
            session.state = SessionState::Active;
            session.reconnect_count += 1;
            session.touch();
            session.clone()
        };

        tracing::info!(
            "Reconnected session {} from {} to {} (reconnect #{})",
            id,
            current.connection_id,
            new_connection,
            updated.reconnect_count
        );
        Ok(updated)
    }

    /// Disconnected sessions that allow reconnection and were active within
    /// the last `window_minutes`
    pub fn get_reconnectable_sessions(&self, window_minutes: u64) -> Vec<TerminalSession> {
        let cutoff = cutoff_millis(minutes(window_minutes));
        self.sessions
            .iter()
            .filter(|s| {
                s.state == SessionState::Disconnected
                    && s.config.enable_reconnection
                    && s.last_activity_at >= cutoff
            })
            .map(|s| s.value().clone())
            .collect()
    }

    /// Drop disconnected sessions idle for longer than `window_minutes`;
    /// returns how many
    pub fn cleanup_expired_sessions(&self, window_minutes: u64) -> usize {
        self.remove_expired_sessions(window_minutes).len()
    }

    pub fn remove_expired_sessions(&self, window_minutes: u64) -> Vec<TerminalSession> {
        let _guard = self.lock();
        let cutoff = cutoff_millis(minutes(window_minutes));

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Disconnected && s.last_activity_at < cutoff)
            .map(|s| s.key().clone())
            .collect();

        let removed: Vec<TerminalSession> = expired
            .iter()
            .filter_map(|id| self.remove_locked(id))
            .map(|mut session| {
                session.state = SessionState::Terminated;
                session
            })
            .collect();
        for session in &removed {
            tracing::info!(
                "Expired session {} (idle since {})",
                session.id,
                session.last_activity_at
            );
        }
        removed
    }

    /// Disconnected sessions, for recovery after a restart
    pub fn export_state(&self) -> RegistrySnapshot {
        let sessions = self
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Disconnected)
            .map(|s| PersistedSession {
                id: s.id.clone(),
                connection_id: s.connection_id.clone(),
                created_at: s.created_at,
                last_activity_at: s.last_activity_at,
                config: s.config.clone(),
                reconnect_count: s.reconnect_count,
                metadata: s.metadata.clone(),
            })
            .collect();

        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: current_time_millis(),
            sessions,
        }
    }

    /// Restore exported sessions as `DISCONNECTED`; returns how many.
    ///
    /// Ids already present are skipped, as are sessions past the global
    /// limit. Wire ids are freshly allocated.
    pub fn import_state(&self, snapshot: RegistrySnapshot) -> usize {
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "Ignoring session state with unsupported version {}",
                snapshot.version
            );
            return 0;
        }

        let _guard = self.lock();
        let mut imported = 0;
        for persisted in snapshot.sessions {
            if self.sessions.contains_key(&persisted.id) {
                tracing::debug!("Skipping imported session {}: id in use", persisted.id);
                continue;
            }
            if self.sessions.len() >= self.limits.max_total_sessions {
                tracing::warn!("Session limit reached while importing state");
                break;
            }

            let session = TerminalSession {
                id: persisted.id,
                wire_id: self.allocate_wire_id(),
                connection_id: persisted.connection_id,
                state: SessionState::Disconnected,
                created_at: persisted.created_at,
                last_activity_at: persisted.last_activity_at,
                config: persisted.config,
                reconnect_count: persisted.reconnect_count,
                metadata: persisted.metadata,
            };
            self.insert_locked(session);
            imported += 1;
        }

        if imported > 0 {
            tracing::info!("Restored {} disconnected sessions", imported);
        }
        imported
    }

    pub fn get_statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            total_sessions: 0,
            created_sessions: 0,
            active_sessions: 0,
            disconnected_sessions: 0,
            total_connections: self.by_connection.len(),
            average_sessions_per_connection: 0.0,
        };
        for session in self.sessions.iter() {
            stats.total_sessions += 1;
            match session.state {
                SessionState::Created => stats.created_sessions += 1,
                SessionState::Active => stats.active_sessions += 1,
                SessionState::Disconnected => stats.disconnected_sessions += 1,
                SessionState::Terminated => {}
            }
        }
        if stats.total_connections > 0 {
            stats.average_sessions_per_connection =
                stats.total_sessions as f64 / stats.total_connections as f64;
        }
        stats
    }

    // Helpers below expect `write_lock` to be held

    fn insert_locked(&self, session: TerminalSession) {
        self.by_connection
            .entry(session.connection_id.clone())
            .or_default()
            .insert(session.id.clone());
        self.by_wire_id
            .insert(session.wire_id.as_u32(), session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    fn remove_locked(&self, id: &str) -> Option<TerminalSession> {
        let (_, session) = self.sessions.remove(id)?;
        self.unindex_connection(&session.connection_id, id);
        self.by_wire_id.remove(&session.wire_id.as_u32());
        Some(session)
    }

    fn unindex_connection(&self, connection_id: &ConnectionId, id: &str) {
        if let Some(mut ids) = self.by_connection.get_mut(connection_id) {
            ids.remove(id);
        }
        self.by_connection
            .remove_if(connection_id, |_, ids| ids.is_empty());
    }

    fn connection_session_count(&self, connection_id: &ConnectionId, excluding: Option<&str>) -> usize {
        self.by_connection
            .get(connection_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| Some(id.as_str()) != excluding)
                    .count()
            })
            .unwrap_or(0)
    }

    fn allocate_wire_id(&self) -> SessionId {
        loop {
            let id = self.next_wire_id.fetch_add(1, Ordering::Relaxed);
            // 0 is the control sentinel; skip it and ids still in use after wraparound
            if id != 0 && !self.by_wire_id.contains_key(&id) {
                return SessionId::new(id);
            }
        }
    }
}

fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(total: usize, per_connection: usize) -> SessionRegistry {
        SessionRegistry::new(RegistryLimits {
            max_total_sessions: total,
            max_sessions_per_connection: per_connection,
        })
    }

    fn config() -> SessionConfig {
        SessionConfig::new(TerminalSize::new(80, 24).unwrap(), MultiplexerType::Native)
    }

    fn create(registry: &SessionRegistry, connection: &str) -> Result<TerminalSession, RegistryError> {
        registry
            .create_session(&ConnectionId::from(connection), config(), None)
            .map(CreateOutcome::into_session)
    }

    fn backdate(registry: &SessionRegistry, id: &str, minutes_ago: u64) {
        let mut session = registry.sessions.get_mut(id).unwrap();
        session.last_activity_at = current_time_millis() - minutes_ago * 60 * 1000;
    }

    fn assert_consistent(registry: &SessionRegistry) {
        let indexed: usize = registry.by_connection.iter().map(|ids| ids.len()).sum();
        assert_eq!(indexed, registry.sessions.len());
        assert_eq!(registry.by_wire_id.len(), registry.sessions.len());
        for entry in registry.by_connection.iter() {
            for id in entry.value() {
                let session = registry.sessions.get(id).unwrap();
                assert_eq!(&session.connection_id, entry.key());
            }
        }
    }

    #[test]
    fn test_create_allocates_unique_ids() {
        let registry = registry(10, 10);
        let a = create(&registry, "c1").unwrap();
        let b = create(&registry, "c1").unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.wire_id, b.wire_id);
        assert!(!a.wire_id.is_control());
        assert_eq!(a.state, SessionState::Created);
        assert_eq!(registry.get_by_wire_id(b.wire_id).unwrap().id, b.id);
        assert_consistent(&registry);
    }

    #[test]
    fn test_create_with_requested_id_is_idempotent() {
        let registry = registry(10, 10);
        let c1 = ConnectionId::from("c1");

        let first = registry
            .create_session(&c1, config(), Some("mine".to_string()))
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let retry = registry
            .create_session(&c1, config(), Some("mine".to_string()))
            .unwrap();
        assert!(matches!(retry, CreateOutcome::Existing(_)));
        assert_eq!(retry.session().wire_id, first.session().wire_id);
        assert_eq!(registry.len(), 1);

        let other = registry.create_session(&ConnectionId::from("c2"), config(), Some("mine".to_string()));
        assert_eq!(other.unwrap_err(), RegistryError::AlreadyExists("mine".to_string()));
    }

    #[test]
    fn test_global_limit_never_evicts() {
        let registry = registry(2, 10);
        let a = create(&registry, "c1").unwrap();
        let b = create(&registry, "c2").unwrap();

        let err = create(&registry, "c3").unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(err, RegistryError::SessionLimit { max: 2 });
        assert!(registry.get_session(&a.id).is_some());
        assert!(registry.get_session(&b.id).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_per_connection_limit() {
        let registry = registry(10, 2);
        create(&registry, "c1").unwrap();
        create(&registry, "c1").unwrap();

        let err = create(&registry, "c1").unwrap_err();
        assert!(matches!(err, RegistryError::ConnectionSessionLimit { max: 2, .. }));

        // Other connections are unaffected
        create(&registry, "c2").unwrap();
        assert_eq!(registry.get_sessions_for_connection(&"c1".into()).len(), 2);
        assert_eq!(registry.get_sessions_for_connection(&"c2".into()).len(), 1);
    }

    #[test]
    fn test_update_session_state() {
        let registry = registry(10, 10);
        let session = create(&registry, "c1").unwrap();

        assert!(!registry.update_session_state("missing", SessionState::Active));
        assert!(registry.update_session_state(&session.id, SessionState::Active));
        assert!(!registry.update_session_state(&session.id, SessionState::Created));
        assert!(registry.mark_disconnected(&session.id));
        // Only reconnection may revive a disconnected session
        assert!(!registry.update_session_state(&session.id, SessionState::Active));
        assert_eq!(
            registry.get_session(&session.id).unwrap().state,
            SessionState::Disconnected
        );
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let registry = registry(10, 10);
        let session = create(&registry, "c1").unwrap();

        assert!(registry.terminate_session(&session.id, "test"));
        assert!(!registry.terminate_session(&session.id, "test"));
        assert!(registry.get_by_wire_id(session.wire_id).is_none());
        assert!(registry.get_sessions_for_connection(&"c1".into()).is_empty());
        assert_consistent(&registry);
    }

    #[test]
    fn test_terminate_connection_sessions() {
        let registry = registry(10, 10);
        create(&registry, "c1").unwrap();
        create(&registry, "c1").unwrap();
        let kept = create(&registry, "c2").unwrap();

        assert_eq!(registry.terminate_connection_sessions(&"c1".into(), "dropped"), 2);
        assert_eq!(registry.terminate_connection_sessions(&"c1".into(), "dropped"), 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.get_session(&kept.id).is_some());
        assert_consistent(&registry);
    }

    #[test]
    fn test_reconnect_scenario() {
        let registry = registry(10, 10);
        let c1 = ConnectionId::from("c1");
        let c2 = ConnectionId::from("c2");

        let session = create(&registry, "c1").unwrap();
        assert_eq!(session.config.columns, 80);
        assert_eq!(session.config.rows, 24);
        assert!(registry.update_session_state(&session.id, SessionState::Active));
        assert!(registry.mark_disconnected(&session.id));

        let reconnectable = registry.get_reconnectable_sessions(30);
        assert_eq!(reconnectable.len(), 1);

        let reconnected = registry.reconnect_session(&session.id, &c2).unwrap();
        assert_eq!(reconnected.state, SessionState::Active);
        assert_eq!(reconnected.reconnect_count, 1);
        assert_eq!(reconnected.connection_id, c2);

        assert!(registry.get_sessions_for_connection(&c1).is_empty());
        assert_eq!(registry.get_sessions_for_connection(&c2).len(), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_reconnect_requires_disconnected() {
        let registry = registry(10, 10);
        let c2 = ConnectionId::from("c2");
        let session = create(&registry, "c1").unwrap();

        // CREATED
        let err = registry.reconnect_session(&session.id, &c2).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState { state: SessionState::Created, .. }));

        // ACTIVE
        registry.update_session_state(&session.id, SessionState::Active);
        assert!(registry.reconnect_session(&session.id, &c2).is_err());

        let unchanged = registry.get_session(&session.id).unwrap();
        assert_eq!(unchanged.connection_id, ConnectionId::from("c1"));
        assert_eq!(unchanged.reconnect_count, 0);
        assert_eq!(unchanged.state, SessionState::Active);

        // TERMINATED (gone)
        registry.terminate_session(&session.id, "test");
        assert_eq!(
            registry.reconnect_session(&session.id, &c2).unwrap_err(),
            RegistryError::NotFound(session.id.clone())
        );
        assert!(registry.get_sessions_for_connection(&c2).is_empty());
    }

    #[test]
    fn test_reconnect_respects_flag_and_limit() {
        let registry = registry(10, 1);
        let c2 = ConnectionId::from("c2");

        let mut no_reconnect = config();
        no_reconnect.enable_reconnection = false;
        let pinned = registry
            .create_session(&"c1".into(), no_reconnect, None)
            .unwrap()
            .into_session();
        registry.mark_disconnected(&pinned.id);
        assert!(registry.get_reconnectable_sessions(30).is_empty());
        assert_eq!(
            registry.reconnect_session(&pinned.id, &c2).unwrap_err(),
            RegistryError::NotReconnectable(pinned.id.clone())
        );

        let session = create(&registry, "c3").unwrap();
        registry.mark_disconnected(&session.id);
        create(&registry, "c2").unwrap();
        let err = registry.reconnect_session(&session.id, &c2).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(
            registry.get_session(&session.id).unwrap().state,
            SessionState::Disconnected
        );
    }

    #[test]
    fn test_reconnect_to_same_connection() {
        let registry = registry(10, 1);
        let c1 = ConnectionId::from("c1");
        let session = create(&registry, "c1").unwrap();
        registry.mark_disconnected(&session.id);

        let reconnected = registry.reconnect_session(&session.id, &c1).unwrap();
        assert_eq!(reconnected.connection_id, c1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_cleanup_expired_sessions() {
        let registry = registry(10, 10);
        let old = create(&registry, "c1").unwrap();
        let recent = create(&registry, "c1").unwrap();
        let active = create(&registry, "c2").unwrap();

        registry.mark_disconnected(&old.id);
        registry.mark_disconnected(&recent.id);
        registry.update_session_state(&active.id, SessionState::Active);
        backdate(&registry, &old.id, 45);
        backdate(&registry, &recent.id, 10);
        backdate(&registry, &active.id, 120);

        assert_eq!(registry.cleanup_expired_sessions(30), 1);
        assert!(registry.get_session(&old.id).is_none());
        assert!(registry.get_session(&recent.id).is_some());
        assert!(registry.get_session(&active.id).is_some());

        let reconnectable = registry.get_reconnectable_sessions(30);
        assert_eq!(reconnectable.len(), 1);
        assert_eq!(reconnectable[0].id, recent.id);
        assert_consistent(&registry);
    }

    #[test]
    fn test_cleanup_ignores_reconnection_flag() {
        let registry = registry(10, 10);
        let mut no_reconnect = config();
        no_reconnect.enable_reconnection = false;
        let session = registry
            .create_session(&"c1".into(), no_reconnect, None)
            .unwrap()
            .into_session();
        registry.mark_disconnected(&session.id);
        backdate(&registry, &session.id, 31);

        assert_eq!(registry.cleanup_expired_sessions(30), 1);
    }

    #[test]
    fn test_export_and_import_state() {
        let registry = registry(10, 10);
        let kept = create(&registry, "c1").unwrap();
        let live = create(&registry, "c1").unwrap();
        registry.set_metadata(&kept.id, "external_id", "work");
        registry.mark_disconnected(&kept.id);
        registry.update_session_state(&live.id, SessionState::Active);

        let snapshot = registry.export_state();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].id, kept.id);

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: RegistrySnapshot = serde_json::from_str(&json).unwrap();

        let fresh = self::registry(10, 10);
        assert_eq!(fresh.import_state(restored.clone()), 1);
        assert_eq!(fresh.import_state(restored), 0);

        let session = fresh.get_session(&kept.id).unwrap();
        assert_eq!(session.state, SessionState::Disconnected);
        assert_eq!(session.metadata["external_id"], "work");
        assert_eq!(session.last_activity_at, snapshot.sessions[0].last_activity_at);
        assert_eq!(fresh.get_by_wire_id(session.wire_id).unwrap().id, kept.id);
        assert_consistent(&fresh);
    }

    #[test]
    fn test_import_keeps_old_timestamps_for_expiry() {
        let registry = registry(10, 10);
        let old = current_time_millis() - 40 * 60 * 1000;
        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: old,
            sessions: vec![PersistedSession {
                id: "stale".to_string(),
                connection_id: "gone".into(),
                created_at: old,
                last_activity_at: old,
                config: config(),
                reconnect_count: 2,
                metadata: HashMap::new(),
            }],
        };

        assert_eq!(registry.import_state(snapshot), 1);
        assert!(registry.get_reconnectable_sessions(30).is_empty());
        assert_eq!(registry.get_reconnectable_sessions(60).len(), 1);
        assert_eq!(registry.cleanup_expired_sessions(30), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_statistics() {
        let registry = registry(10, 10);
        assert_eq!(registry.get_statistics().average_sessions_per_connection, 0.0);

        let a = create(&registry, "c1").unwrap();
        create(&registry, "c1").unwrap();
        let c = create(&registry, "c2").unwrap();
        registry.update_session_state(&a.id, SessionState::Active);
        registry.mark_disconnected(&c.id);

        let stats = registry.get_statistics();
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.average_sessions_per_connection, 1.5);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.created_sessions, 1);
        assert_eq!(stats.disconnected_sessions, 1);
    }

    #[test]
    fn test_concurrent_creates_respect_limit() {
        use std::sync::Arc;

        let registry = Arc::new(registry(20, 100));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| create(&registry, &format!("c{}", n)).is_ok())
                        .count()
                })
            })
            .collect();

        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(created, 20);
        assert_eq!(registry.len(), 20);
        assert_consistent(&registry);
    }
}
