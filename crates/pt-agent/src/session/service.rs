//! Session service
//!
//! Ties the registry, the backends and the output router together. Every
//! control-plane operation on a session goes through here; the connection
//! handler only decodes requests and encodes replies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pt_core::config::AgentConfig;
use pt_core::{
    AgentError, BackendError, BackendSessionConfig, ConnectionId, RegistryError, ShellDetector,
    ShellError, TerminalBackend,
};
use pt_protocol::{
    AttachRequest, AttachResponse, CapabilitiesMessage, CreateRequest, CreateResponse,
    CreateSessionRequest, Frame, FramePayload, ListSessionsRequest, ListSessionsResponse,
    ResizeSessionRequest, ServerInfo, ServerMessage, SessionId, SessionState, SessionSummary,
    TerminalSize, PROTOCOL_VERSION,
};

use super::output::{OutputRouter, SessionExit};
use super::registry::{
    CreateOutcome, RegistryLimits, RegistrySnapshot, RegistryStatistics, SessionConfig,
    SessionRegistry, TerminalSession,
};
use crate::backend::BackendSet;

/// Metadata key holding the external multiplexer session id
pub const EXTERNAL_ID_KEY: &str = "external_id";

/// Metadata key marking an external session the agent started; only these
/// are ended when the registry session is destroyed
pub const OWNED_KEY: &str = "owned";

/// Metadata key holding the local process id
pub const PID_KEY: &str = "pid";

/// How long to wait for an exit code once a session's output ended
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);
const EXIT_STATUS_POLL: Duration = Duration::from_millis(25);

/// How a backend process comes to exist
enum Launch {
    Create,
    Attach(String),
}

pub struct SessionService {
    config: AgentConfig,
    registry: SessionRegistry,
    backends: BackendSet,
    shells: ShellDetector,
    router: Arc<OutputRouter>,
}

impl SessionService {
    /// Create the service and the receiver its exit watcher consumes
    pub fn new(config: AgentConfig, backends: BackendSet) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let (router, exits) = OutputRouter::new();
        let service = Self {
            registry: SessionRegistry::new(RegistryLimits::from(&config)),
            shells: ShellDetector::from_config(&config),
            backends,
            router: Arc::new(router),
            config,
        };
        (service, exits)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn statistics(&self) -> RegistryStatistics {
        self.registry.get_statistics()
    }

    /// Start delivering session output for a connection
    pub fn register_connection(&self, connection: ConnectionId, tx: mpsc::Sender<Frame>) {
        self.router.register_connection(connection, tx);
    }

    /// Create a session and start its backend process.
    ///
    /// On success the `session_created` message is queued to the connection
    /// ahead of any output, so the caller sends nothing further.
    pub async fn create_session(
        &self,
        connection: &ConnectionId,
        request: CreateSessionRequest,
    ) -> Result<SessionSummary, AgentError> {
        request.validate()?;
        let size = request.size()?;
        let mut config = SessionConfig::from_request(&request, self.config.preferred_multiplexer);
        let backend = self.backends.get(config.multiplexer)?;
        let shell = self.resolve_shell(request.shell.as_deref())?;
        config.shell = Some(shell.display().to_string());

        let session = match self
            .registry
            .create_session(connection, config, request.session_id.clone())?
        {
            CreateOutcome::Existing(session) => {
                self.announce_created(connection, &session, vec![]).await;
                return Ok(session.summary());
            }
            CreateOutcome::Created(session) => session,
        };

        let mut backend_config = BackendSessionConfig::new(session.id.clone(), size)
            .with_shell(self.shells.shell_command(&shell))
            .with_env(self.session_env(request.env.iter()));
        if let Some(dir) = &request.working_dir {
            backend_config = backend_config.with_working_dir(dir);
        }

        let session = self
            .launch(&session, backend.as_ref(), &backend_config, Launch::Create)
            .await?;
        self.announce_created(connection, &session, vec![]).await;
        Ok(session.summary())
    }

    /// Close a session owned by `connection`
    pub async fn close_session(&self, connection: &ConnectionId, session_id: &str) -> Result<(), AgentError> {
        let session = self.owned_session(connection, session_id)?;
        self.router.remove(session_id);
        self.registry.terminate_session(session_id, "closed by client");
        self.destroy_backend(&session).await;
        Ok(())
    }

    pub async fn resize_session(
        &self,
        connection: &ConnectionId,
        request: &ResizeSessionRequest,
    ) -> Result<(), AgentError> {
        request.validate()?;
        let session = self.owned_session(connection, &request.session_id)?;
        self.resize(&session, request.size()?).await
    }

    /// Resize from a binary resize frame
    pub async fn resize_wire(
        &self,
        connection: &ConnectionId,
        wire_id: SessionId,
        size: TerminalSize,
    ) -> Result<(), AgentError> {
        let session = self.owned_wire_session(connection, wire_id)?;
        self.resize(&session, size).await
    }

    async fn resize(&self, session: &TerminalSession, size: TerminalSize) -> Result<(), AgentError> {
        let backend = self.backends.get(session.config.multiplexer)?;
        backend.resize(&session.id, size).await?;
        self.registry.update_geometry(&session.id, size);
        Ok(())
    }

    /// Forward client keystrokes to a session's process
    pub async fn write_input(
        &self,
        connection: &ConnectionId,
        wire_id: SessionId,
        data: &[u8],
    ) -> Result<(), AgentError> {
        let session = self.owned_wire_session(connection, wire_id)?;
        if session.state != SessionState::Active {
            return Err(RegistryError::InvalidState {
                session_id: session.id,
                state: session.state,
                expected: SessionState::Active,
            }
            .into());
        }
        let backend = self.backends.get(session.config.multiplexer)?;
        backend.write_input(&session.id, data).await?;
        self.registry.touch(&session.id);
        Ok(())
    }

    /// A connection went away: keep reconnectable sessions, drop the rest
    pub async fn connection_dropped(&self, connection: &ConnectionId) {
        self.router.unregister_connection(connection);

        for session in self.registry.get_sessions_for_connection(connection) {
            match session.state {
                SessionState::Disconnected | SessionState::Terminated => continue,
                _ if session.config.enable_reconnection => {
                    self.router.detach(&session.id);
                    self.registry.mark_disconnected(&session.id);
                    tracing::info!("Session {} disconnected, kept for reconnection", session.id);
                }
                _ => {
                    self.router.remove(&session.id);
                    self.registry.terminate_session(&session.id, "connection dropped");
                    self.destroy_backend(&session).await;
                }
            }
        }
    }

    /// Rebind a disconnected session to `connection` and replay its output.
    ///
    /// If the process did not survive (the agent restarted), sessions on a
    /// persistent backend are re-attached through their external id; any
    /// other session is dropped and reported as not found.
    pub async fn reconnect_session(
        &self,
        connection: &ConnectionId,
        session_id: &str,
    ) -> Result<SessionSummary, AgentError> {
        let session = self.registry.reconnect_session(session_id, connection)?;

        if !self.router.has_route(session_id) {
            self.reattach(&session).await?;
        }

        let summary = self
            .registry
            .get_session(session_id)
            .map(|s| s.summary())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        let announced = summary.clone();
        self.router.attach(session_id, connection, move |replayed| {
            control_frames([ServerMessage::SessionReconnected {
                session: announced,
                replayed_bytes: replayed as u64,
            }])
        })
        .await;
        Ok(summary)
    }

    async fn reattach(&self, session: &TerminalSession) -> Result<(), AgentError> {
        let not_found = || AgentError::from(RegistryError::NotFound(session.id.clone()));

        let backend = match self.backends.get(session.config.multiplexer) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!("Cannot restore session {}: {}", session.id, e);
                self.registry.terminate_session(&session.id, "backend unavailable");
                return Err(not_found());
            }
        };

        let external_id = session
            .metadata
            .get(EXTERNAL_ID_KEY)
            .filter(|_| backend.capabilities().persistence)
            .cloned();
        let Some(external_id) = external_id else {
            self.registry
                .terminate_session(&session.id, "process did not survive");
            return Err(not_found());
        };

        let backend_config = BackendSessionConfig::new(session.id.clone(), session.config.size())
            .with_env(self.session_env(session.config.env.iter()))
            .with_ownership(session.metadata.contains_key(OWNED_KEY));
        self.launch(session, backend.as_ref(), &backend_config, Launch::Attach(external_id))
            .await
            .map_err(|e| {
                tracing::warn!("Failed to re-attach session {}: {}", session.id, e);
                not_found()
            })?;
        Ok(())
    }

    /// Sessions of `connection` plus every session still open for
    /// reconnection
    pub fn list_sessions(&self, connection: &ConnectionId) -> Vec<SessionSummary> {
        let mut seen = HashSet::new();
        let mut sessions: Vec<SessionSummary> = self
            .registry
            .get_sessions_for_connection(connection)
            .into_iter()
            .chain(
                self.registry
                    .get_reconnectable_sessions(self.config.reconnection_window_minutes),
            )
            .filter(|s| seen.insert(s.id.clone()))
            .map(|s| s.summary())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Remove sessions disconnected for longer than the reconnection window
    pub async fn sweep_expired(&self) -> usize {
        let expired = self
            .registry
            .remove_expired_sessions(self.config.reconnection_window_minutes);
        for session in &expired {
            self.router.remove(&session.id);
            self.destroy_backend(session).await;
        }
        expired.len()
    }

    /// Tear down a session whose output stream ended
    pub async fn handle_exit(&self, exit: SessionExit) {
        let Some(session) = self.registry.get_session(&exit.session_id) else {
            self.router.remove(&exit.session_id);
            return;
        };

        let exit_code = match self.backends.get(session.config.multiplexer) {
            Ok(backend) => wait_for_exit_status(backend.as_ref(), &session.id).await,
            Err(_) => None,
        };
        tracing::info!("Session {} exited with {:?}", session.id, exit_code);

        let owner = self.router.close(&session.id, exit_code).await;
        self.registry.terminate_session(&session.id, "process exited");
        self.destroy_backend(&session).await;

        if let Some(owner) = owner {
            let message = ServerMessage::SessionClosed {
                session_id: session.id.clone(),
                reason: match exit_code {
                    Some(code) => format!("process exited with status {}", code),
                    None => "process exited".to_string(),
                },
            };
            for frame in control_frames([message]) {
                self.router.send_to(&owner, frame).await;
            }
        }
    }

    /// Consume end-of-stream notifications until cancelled
    pub async fn run_exit_watcher(
        self: Arc<Self>,
        mut exits: mpsc::UnboundedReceiver<SessionExit>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Exit watcher shutting down");
                    break;
                }
                exit = exits.recv() => match exit {
                    Some(exit) => self.handle_exit(exit).await,
                    None => break,
                }
            }
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            default_shell: self
                .shells
                .default_shell()
                .ok()
                .map(|shell| shell.path.display().to_string()),
            shells: self
                .shells
                .detect_shells()
                .map(|shell| shell.path.display().to_string())
                .collect(),
            backends: self.backends.descriptors(),
            max_sessions_per_connection: self.config.max_sessions_per_connection as u32,
            max_total_sessions: self.config.max_total_sessions as u32,
        }
    }

    pub fn capabilities(&self) -> CapabilitiesMessage {
        CapabilitiesMessage {
            backends: self.backends.descriptors(),
        }
    }

    /// Sessions known to an external multiplexer
    pub async fn mux_list(&self, request: &ListSessionsRequest) -> ListSessionsResponse {
        let mt = request.multiplexer_type;
        let listed = match self.backends.get(mt) {
            Ok(backend) => backend.list_sessions().await,
            Err(e) => Err(e),
        };
        match listed {
            Ok(sessions) => ListSessionsResponse::ok(mt, sessions),
            Err(e) => {
                tracing::warn!("Listing {} sessions failed: {}", mt, e);
                ListSessionsResponse::failed(mt, e.to_string())
            }
        }
    }

    /// Attach a new registry session to an existing multiplexer session.
    ///
    /// On success the attach response and `session_created` are queued to
    /// the connection.
    pub async fn mux_attach(&self, connection: &ConnectionId, request: &AttachRequest) -> Result<(), AgentError> {
        request.validate()?;
        let mt = request.multiplexer_type;
        let backend = self.backends.get(mt)?;
        if !backend.capabilities().attach {
            return Err(BackendError::Command {
                command: "attach".to_string(),
                message: format!("the {} backend cannot attach to existing sessions", mt),
            }
            .into());
        }

        let session = self
            .registry
            .create_session(connection, SessionConfig::new(request.size, mt), None)?
            .into_session();
        let backend_config = BackendSessionConfig::new(session.id.clone(), request.size)
            .with_env(self.session_env(std::iter::empty()));
        let session = self
            .launch(
                &session,
                backend.as_ref(),
                &backend_config,
                Launch::Attach(request.external_id.clone()),
            )
            .await?;

        let response = AttachResponse::ok(session.id.clone(), request.external_id.clone());
        self.announce_created(
            connection,
            &session,
            vec![Frame::connection(FramePayload::MuxAttachResponse(response))],
        )
        .await;
        Ok(())
    }

    /// Create a new multiplexer session and a registry session attached to it
    pub async fn mux_create(&self, connection: &ConnectionId, request: &CreateRequest) -> Result<(), AgentError> {
        request.validate()?;
        let mt = request.multiplexer_type;
        let backend = self.backends.get(mt)?;
        let shell = self.resolve_shell(request.shell.as_deref())?;

        let mut config = SessionConfig::new(request.size, mt);
        config.shell = Some(shell.display().to_string());
        config.working_dir = request.working_dir.clone();
        config.env = request.env.iter().cloned().collect();
        let session = self
            .registry
            .create_session(connection, config, None)?
            .into_session();

        let mut backend_config = BackendSessionConfig::new(session.id.clone(), request.size)
            .with_shell(self.shells.shell_command(&shell))
            .with_env(self.session_env(request.env.iter().map(|(k, v)| (k, v))));
        if !request.name.is_empty() {
            backend_config = backend_config.with_name(request.name.clone());
        }
        if let Some(dir) = &request.working_dir {
            backend_config = backend_config.with_working_dir(dir);
        }

        let session = self
            .launch(&session, backend.as_ref(), &backend_config, Launch::Create)
            .await?;
        let external_id = session
            .metadata
            .get(EXTERNAL_ID_KEY)
            .cloned()
            .unwrap_or_default();
        let response = CreateResponse::ok(session.id.clone(), external_id);
        self.announce_created(
            connection,
            &session,
            vec![Frame::connection(FramePayload::MuxCreateResponse(response))],
        )
        .await;
        Ok(())
    }

    /// Restore sessions exported by a previous run
    pub fn restore(&self, snapshot: RegistrySnapshot) -> usize {
        self.registry.import_state(snapshot)
    }

    /// Stop every session and return what can be recovered on restart.
    ///
    /// Live sessions on persistent backends are marked disconnected first so
    /// they are part of the snapshot; their external sessions keep running.
    pub async fn shutdown(&self) -> RegistrySnapshot {
        for session in self.registry.list_sessions() {
            let persistent = self
                .backends
                .get(session.config.multiplexer)
                .map(|backend| backend.capabilities().persistence)
                .unwrap_or(false);
            if persistent && session.config.enable_reconnection {
                self.registry.mark_disconnected(&session.id);
            }
            self.router.remove(&session.id);
        }

        let snapshot = self.registry.export_state();
        self.backends.shutdown_all().await;
        tracing::info!(
            "Session service stopped ({} sessions recoverable)",
            snapshot.sessions.len()
        );
        snapshot
    }

    /// Start the backend process for a registered session, then route its
    /// output and mark it active. The registry entry is rolled back on
    /// failure.
    async fn launch(
        &self,
        session: &TerminalSession,
        backend: &dyn TerminalBackend,
        config: &BackendSessionConfig,
        launch: Launch,
    ) -> Result<TerminalSession, AgentError> {
        let started = match &launch {
            Launch::Create => backend.create_session(config).await,
            Launch::Attach(external_id) => backend.attach_session(external_id, config).await,
        };
        let started = match started {
            Ok(started) => started,
            Err(e) => {
                tracing::error!("Backend failed to start session {}: {}", session.id, e);
                self.registry
                    .terminate_session(&session.id, "backend failed to start");
                return Err(e.into());
            }
        };

        if let Some(external_id) = &started.external_id {
            self.registry
                .set_metadata(&session.id, EXTERNAL_ID_KEY, external_id.clone());
            if matches!(launch, Launch::Create) {
                self.registry
                    .set_metadata(&session.id, OWNED_KEY, "true".to_string());
            }
        }
        if let Some(pid) = started.pid {
            self.registry
                .set_metadata(&session.id, PID_KEY, pid.to_string());
        }

        let reader = match backend.take_output(&session.id) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!("No output stream for session {}: {}", session.id, e);
                self.registry
                    .terminate_session(&session.id, "backend output unavailable");
                if let Err(destroy) = backend.destroy_session(&session.id).await {
                    tracing::debug!(
                        "Rolling back backend for session {}: {}",
                        session.id,
                        destroy
                    );
                }
                return Err(e.into());
            }
        };

        self.router.add_route(&session.id, session.wire_id);
        self.router.spawn_pump(session.id.clone(), reader);
        self.registry
            .update_session_state(&session.id, SessionState::Active);

        self.registry
            .get_session(&session.id)
            .ok_or_else(|| RegistryError::NotFound(session.id.clone()).into())
    }

    async fn announce_created(
        &self,
        connection: &ConnectionId,
        session: &TerminalSession,
        mut frames: Vec<Frame>,
    ) {
        frames.extend(control_frames([ServerMessage::SessionCreated {
            session: session.summary(),
        }]));
        self.router.attach(&session.id, connection, move |_| frames).await;
    }

    async fn destroy_backend(&self, session: &TerminalSession) {
        let Ok(backend) = self.backends.get(session.config.multiplexer) else {
            return;
        };
        if let Err(e) = backend.destroy_session(&session.id).await {
            tracing::debug!("Destroying backend for session {}: {}", session.id, e);
        }
    }

    /// Requested shell, or the default one; both must pass the allow-list
    fn resolve_shell(&self, requested: Option<&str>) -> Result<PathBuf, ShellError> {
        match requested {
            Some(path) => self.shells.validate_shell(Path::new(path)),
            None => {
                let default = self.shells.default_shell()?;
                self.shells.validate_shell(&default.path)
            }
        }
    }

    /// Configured default environment overlaid with `extra`
    fn session_env<'a, I>(&self, extra: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut env: Vec<(String, String)> = self.config.default_env.clone();
        let mut extra: Vec<(&String, &String)> = extra.into_iter().collect();
        extra.sort();
        for (key, value) in extra {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.clone(),
                None => env.push((key.clone(), value.clone())),
            }
        }
        env
    }

    fn owned_session(&self, connection: &ConnectionId, session_id: &str) -> Result<TerminalSession, RegistryError> {
        self.registry
            .get_session(session_id)
            .filter(|s| &s.connection_id == connection)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    fn owned_wire_session(&self, connection: &ConnectionId, wire_id: SessionId) -> Result<TerminalSession, RegistryError> {
        self.registry
            .get_by_wire_id(wire_id)
            .filter(|s| &s.connection_id == connection)
            .ok_or_else(|| RegistryError::NotFound(wire_id.to_string()))
    }
}

async fn wait_for_exit_status(backend: &dyn TerminalBackend, session_id: &str) -> Option<i32> {
    let deadline = tokio::time::Instant::now() + EXIT_STATUS_WAIT;
    loop {
        if let Some(code) = backend.exit_status(session_id) {
            return Some(code);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_STATUS_POLL).await;
    }
}

/// Encode control messages as frames, dropping any that fail to serialize
pub fn control_frames<I>(messages: I) -> Vec<Frame>
where
    I: IntoIterator<Item = ServerMessage>,
{
    messages
        .into_iter()
        .filter_map(|message| match message.to_frame() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!("Failed to encode control message: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pt_protocol::ErrorCode;
    use std::collections::HashMap;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn service(config: AgentConfig) -> (Arc<SessionService>, mpsc::UnboundedReceiver<SessionExit>) {
        let mut backends = BackendSet::empty();
        backends.register(Arc::new(crate::backend::NativeBackend::new()));
        let (service, exits) = SessionService::new(config, backends);
        (Arc::new(service), exits)
    }

    fn connect(service: &SessionService, id: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let connection = ConnectionId::from(id);
        let (tx, rx) = mpsc::channel(256);
        service.register_connection(connection.clone(), tx);
        (connection, rx)
    }

    fn sh_request() -> CreateSessionRequest {
        CreateSessionRequest::new(80, 24)
            .unwrap()
            .with_shell("/bin/sh")
            .unwrap()
    }

    async fn next_control(rx: &mut mpsc::Receiver<Frame>) -> ServerMessage {
        loop {
            let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if let FramePayload::Control(json) = frame.payload {
                return ServerMessage::from_json(&json).unwrap();
            }
        }
    }

    async fn read_output_until(rx: &mut mpsc::Receiver<Frame>, needle: &str) -> String {
        let mut output = String::new();
        while !output.contains(needle) {
            let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if let FramePayload::Data(data) = frame.payload {
                output.push_str(&String::from_utf8_lossy(&data));
            }
        }
        output
    }

    #[tokio::test]
    async fn test_create_write_and_close() {
        let (service, _exits) = service(AgentConfig::default());
        let (conn, mut rx) = connect(&service, "c1");

        let summary = service.create_session(&conn, sh_request()).await.unwrap();
        assert_eq!(summary.state, SessionState::Active);
        assert_eq!(summary.shell.as_deref(), Some("/bin/sh"));
        match next_control(&mut rx).await {
            ServerMessage::SessionCreated { session } => assert_eq!(session.id, summary.id),
            other => panic!("unexpected {:?}", other),
        }

        let wire_id = SessionId::new(summary.wire_id);
        service
            .write_input(&conn, wire_id, b"echo pocket-$((6*7))\n")
            .await
            .unwrap();
        assert!(read_output_until(&mut rx, "pocket-42").await.contains("pocket-42"));

        service.close_session(&conn, &summary.id).await.unwrap();
        assert!(service.registry().get_session(&summary.id).is_none());
        assert!(service.list_sessions(&conn).is_empty());
    }

    #[tokio::test]
    async fn test_other_connection_cannot_touch_session() {
        let (service, _exits) = service(AgentConfig::default());
        let (owner, _rx) = connect(&service, "owner");
        let (other, _other_rx) = connect(&service, "other");

        let summary = service.create_session(&owner, sh_request()).await.unwrap();
        let err = service.close_session(&other, &summary.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.session_id(), Some(summary.id.as_str()));

        let err = service
            .write_input(&other, SessionId::new(summary.wire_id), b"x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);

        service.close_session(&owner, &summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_replays_output() {
        let (service, _exits) = service(AgentConfig::default());
        let (c1, _rx1) = connect(&service, "c1");

        let summary = service.create_session(&c1, sh_request()).await.unwrap();
        let wire_id = SessionId::new(summary.wire_id);

        service.connection_dropped(&c1).await;
        let session = service.registry().get_session(&summary.id).unwrap();
        assert_eq!(session.state, SessionState::Disconnected);

        // The process keeps running and its output is buffered meanwhile
        let (c2, mut rx2) = connect(&service, "c2");
        let listed = service.list_sessions(&c2);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, SessionState::Disconnected);

        let reconnected = service.reconnect_session(&c2, &summary.id).await.unwrap();
        assert_eq!(reconnected.state, SessionState::Active);
        assert_eq!(reconnected.reconnect_count, 1);
        assert!(matches!(
            next_control(&mut rx2).await,
            ServerMessage::SessionReconnected { .. }
        ));

        service
            .write_input(&c2, wire_id, b"echo back-$((1+1))\n")
            .await
            .unwrap();
        assert!(read_output_until(&mut rx2, "back-2").await.contains("back-2"));

        service.close_session(&c2, &summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_without_reconnection_terminates() {
        let (service, _exits) = service(AgentConfig::default());
        let (c1, _rx) = connect(&service, "c1");

        let request = sh_request().with_reconnection(false);
        let summary = service.create_session(&c1, request).await.unwrap();
        service.connection_dropped(&c1).await;
        assert!(service.registry().get_session(&summary.id).is_none());
    }

    #[tokio::test]
    async fn test_exit_is_reported_to_owner() {
        let (service, mut exits) = service(AgentConfig::default());
        let (conn, mut rx) = connect(&service, "c1");

        let summary = service.create_session(&conn, sh_request()).await.unwrap();
        service
            .write_input(&conn, SessionId::new(summary.wire_id), b"exit 5\n")
            .await
            .unwrap();

        let exit = timeout(WAIT, exits.recv()).await.unwrap().unwrap();
        assert_eq!(exit.session_id, summary.id);
        service.handle_exit(exit).await;
        assert!(service.registry().get_session(&summary.id).is_none());

        let mut saw_close_frame = false;
        loop {
            let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            match frame.payload {
                FramePayload::SessionClosed { .. } => saw_close_frame = true,
                FramePayload::Control(json) => {
                    if let ServerMessage::SessionClosed { session_id, .. } =
                        ServerMessage::from_json(&json).unwrap()
                    {
                        assert_eq!(session_id, summary.id);
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_close_frame);
    }

    #[tokio::test]
    async fn test_allow_list_rejects_other_shells() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            allowed_shells: vec![dir.path().join("not-a-shell")],
            ..AgentConfig::default()
        };
        let (service, _exits) = service(config);
        let (conn, _rx) = connect(&service, "c1");

        let err = service.create_session(&conn, sh_request()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(service.registry().is_empty());
    }

    /// Starts "sessions" that never produce an output stream
    #[derive(Default)]
    struct NoOutputBackend {
        destroyed: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TerminalBackend for NoOutputBackend {
        fn multiplexer_type(&self) -> pt_protocol::MultiplexerType {
            pt_protocol::MultiplexerType::Native
        }

        fn capabilities(&self) -> pt_protocol::BackendCapabilities {
            pt_protocol::BackendCapabilities::default()
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn initialize(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn create_session(
            &self,
            _config: &BackendSessionConfig,
        ) -> Result<pt_core::BackendSession, BackendError> {
            Ok(pt_core::BackendSession::default())
        }

        async fn attach_session(
            &self,
            external_id: &str,
            _config: &BackendSessionConfig,
        ) -> Result<pt_core::BackendSession, BackendError> {
            Err(BackendError::NotFound(external_id.to_string()))
        }

        async fn list_sessions(
            &self,
        ) -> Result<Vec<pt_protocol::MultiplexerSessionInfo>, BackendError> {
            Ok(vec![])
        }

        async fn write_input(&self, session_id: &str, _data: &[u8]) -> Result<(), BackendError> {
            Err(BackendError::NotFound(session_id.to_string()))
        }

        fn take_output(&self, _session_id: &str) -> Result<Box<dyn std::io::Read + Send>, BackendError> {
            Err(BackendError::Spawn("no output".to_string()))
        }

        async fn resize(&self, _session_id: &str, _size: TerminalSize) -> Result<(), BackendError> {
            Ok(())
        }

        async fn destroy_session(&self, session_id: &str) -> Result<(), BackendError> {
            self.destroyed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(BackendError::NotFound(session_id.to_string()))
        }

        fn has_session(&self, _session_id: &str) -> bool {
            false
        }

        fn exit_status(&self, _session_id: &str) -> Option<i32> {
            None
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_missing_output_rolls_back_session() {
        let backend = Arc::new(NoOutputBackend::default());
        let mut backends = BackendSet::empty();
        backends.register(backend.clone());
        let (service, _exits) = SessionService::new(AgentConfig::default(), backends);
        let (conn, _rx) = connect(&service, "c1");

        assert!(service.create_session(&conn, sh_request()).await.is_err());
        assert!(service.registry().is_empty());
        assert_eq!(
            backend.destroyed.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let (service, _exits) = service(AgentConfig::default());
        let (conn, _rx) = connect(&service, "c1");

        let request = sh_request().with_multiplexer(pt_protocol::MultiplexerType::Tmux);
        let err = service.create_session(&conn, request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoBackend);
        assert!(service.registry().is_empty());

        let listed = service
            .mux_list(&ListSessionsRequest::new(pt_protocol::MultiplexerType::Screen))
            .await;
        assert!(!listed.is_success());
    }

    #[tokio::test]
    async fn test_restored_native_session_cannot_reconnect() {
        let (service, _exits) = service(AgentConfig::default());
        let (c1, _rx) = connect(&service, "c1");
        let summary = service.create_session(&c1, sh_request()).await.unwrap();
        service.connection_dropped(&c1).await;
        let snapshot = service.shutdown().await;
        assert_eq!(snapshot.sessions.len(), 1);

        let (restarted, _exits) = self::service(AgentConfig::default());
        assert_eq!(restarted.restore(snapshot), 1);
        let (c2, _rx2) = connect(&restarted, "c2");

        let err = restarted
            .reconnect_session(&c2, &summary.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert!(restarted.registry().is_empty());
    }

    #[tokio::test]
    async fn test_session_env_overrides_defaults() {
        let (service, _exits) = service(AgentConfig::default());
        let mut extra = HashMap::new();
        extra.insert("TERM".to_string(), "dumb".to_string());
        extra.insert("LANG".to_string(), "C".to_string());

        let env = service.session_env(extra.iter());
        assert!(env.contains(&("TERM".to_string(), "dumb".to_string())));
        assert!(env.contains(&("LANG".to_string(), "C".to_string())));
        assert_eq!(env.iter().filter(|(k, _)| k == "TERM").count(), 1);
    }
}
