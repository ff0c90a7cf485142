//! Per-connection frame handling
//!
//! Each accepted connection gets one handler task. Inbound frames are read
//! with [`FrameCodec`]; everything outbound (replies, session output from
//! the router, broadcast events) goes through one mpsc channel drained by a
//! writer task, so frames are never interleaved mid-write.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use pt_core::{AgentError, ConnectionId, RegistryError};
use pt_protocol::{
    AttachResponse, ClientMessage, CreateResponse, ErrorCode, Frame, FrameCodec, FramePayload,
    ServerMessage, SessionId, TerminalSize,
};

use crate::state::AgentState;

/// Outbound frames queued per connection
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// How long a closing connection may take to flush its queue
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one connection until EOF, a codec error, the idle timeout or
/// agent shutdown
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<AgentState>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::new());

    let (tx, rx) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAPACITY);
    let writer_task = spawn_writer(write_half, rx);

    let mut handler = ConnectionHandler::new(peer, state, tx);
    handler.run(&mut reader).await;

    let ConnectionHandler { id, state, tx, .. } = handler;
    state.service.connection_dropped(&id).await;
    drop(tx);

    if !finish_writer(writer_task, FLUSH_TIMEOUT).await {
        tracing::debug!("Gave up flushing output to {}", peer);
    }
    tracing::debug!("Connection {} ({}) finished", id, peer);
}

/// Drain `rx` into `write_half` until every sender is gone
fn spawn_writer<W>(write_half: W, mut rx: mpsc::Receiver<Frame>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = FramedWrite::new(write_half, FrameCodec::new());
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                tracing::debug!("Write failed: {}", e);
                return;
            }
        }
        let _ = writer.close().await;
    })
}

/// Wait up to `grace` for the writer to flush, then abort it.
///
/// Aborting drops the outbound receiver, so session pumps still holding a
/// sender fail fast and fall back to buffering. False if it was aborted.
async fn finish_writer(mut writer_task: JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut writer_task).await.is_ok() {
        return true;
    }
    writer_task.abort();
    let _ = writer_task.await;
    false
}

/// State of one client connection
pub struct ConnectionHandler {
    id: ConnectionId,
    peer: SocketAddr,
    state: Arc<AgentState>,
    tx: mpsc::Sender<Frame>,
    authenticated: bool,
}

impl ConnectionHandler {
    fn new(peer: SocketAddr, state: Arc<AgentState>, tx: mpsc::Sender<Frame>) -> Self {
        let id = ConnectionId::new(uuid::Uuid::new_v4().to_string());
        state.service.register_connection(id.clone(), tx.clone());
        Self {
            authenticated: !state.config.requires_auth(),
            id,
            peer,
            state,
            tx,
        }
    }

    async fn run<S>(&mut self, reader: &mut S)
    where
        S: futures::Stream<Item = Result<Frame, pt_protocol::ProtocolError>> + Unpin,
    {
        self.send(ServerMessage::Connected {
            connection_id: self.id.to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            requires_auth: !self.authenticated,
        })
        .await;
        if self.authenticated {
            self.send_capabilities().await;
        }

        let idle_timeout = self.state.config.disconnect_timeout;
        let mut deadline = Instant::now() + idle_timeout;
        let mut events = self.state.events.subscribe();
        let cancel = self.state.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.send(ServerMessage::ServerShutdown {
                        reason: "agent shutting down".to_string(),
                    })
                    .await;
                    break;
                }

                event = events.recv() => match event {
                    Ok(event) => {
                        if self.authenticated {
                            self.send(event).await;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Connection {} lagged {} events", self.id, n);
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("Connection from {} idle for {:?}, dropping", self.peer, idle_timeout);
                    break;
                }

                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        deadline = Instant::now() + idle_timeout;
                        if !self.handle_frame(frame).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Invalid frame from {}: {}", self.peer, e);
                        break;
                    }
                    None => {
                        tracing::info!("Connection from {} closed normally", self.peer);
                        break;
                    }
                },
            }
        }
    }

    /// Returns false when the connection should be closed
    async fn handle_frame(&mut self, frame: Frame) -> bool {
        let wire_id = frame.session_id;
        match frame.payload {
            FramePayload::Control(text) => return self.handle_control(&text).await,
            _ if !self.authenticated => {
                self.send_error(AgentError::AuthFailed("authentication required".to_string()))
                    .await;
            }
            FramePayload::Data(data) => {
                let result = self.state.service.write_input(&self.id, wire_id, &data).await;
                self.report(result).await;
            }
            FramePayload::Resize(size) => self.resize(wire_id, size).await,
            FramePayload::SessionClosed { .. } => self.close_wire(wire_id).await,
            FramePayload::MuxList(request) => {
                let response = self.state.service.mux_list(&request).await;
                self.send_frame(Frame::connection(FramePayload::MuxListResponse(response)))
                    .await;
            }
            FramePayload::MuxAttach(request) => {
                if let Err(e) = self.state.service.mux_attach(&self.id, &request).await {
                    tracing::debug!("Attach to {} failed: {}", request.external_id, e);
                    let response = AttachResponse::failed(request.external_id.clone(), e.to_string());
                    self.send_frame(Frame::connection(FramePayload::MuxAttachResponse(response)))
                        .await;
                }
            }
            FramePayload::MuxCreate(request) => {
                if let Err(e) = self.state.service.mux_create(&self.id, &request).await {
                    tracing::debug!("Multiplexer create failed: {}", e);
                    let response = CreateResponse::failed(e.to_string());
                    self.send_frame(Frame::connection(FramePayload::MuxCreateResponse(response)))
                        .await;
                }
            }
            FramePayload::Capabilities(_) => self.send_capabilities().await,
            FramePayload::MuxListResponse(_)
            | FramePayload::MuxAttachResponse(_)
            | FramePayload::MuxCreateResponse(_) => {
                self.send(ServerMessage::error(
                    ErrorCode::InvalidRequest,
                    "response frames are not accepted from clients",
                    None,
                ))
                .await;
            }
        }
        true
    }

    async fn handle_control(&mut self, text: &str) -> bool {
        let message = match ClientMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Bad control message from {}: {}", self.peer, e);
                self.send(ServerMessage::error(ErrorCode::InvalidRequest, e.to_string(), None))
                    .await;
                return true;
            }
        };

        if !self.authenticated {
            match message {
                ClientMessage::Authenticate { token } => return self.authenticate(&token).await,
                ClientMessage::Ping { timestamp } => {
                    self.send(ServerMessage::Pong { timestamp }).await;
                }
                other => {
                    let session_id = other.session_id().map(String::from);
                    self.send(ServerMessage::error(
                        ErrorCode::AuthFailed,
                        "authentication required",
                        session_id,
                    ))
                    .await;
                }
            }
            return true;
        }

        let service = Arc::clone(&self.state.service);
        match message {
            ClientMessage::Authenticate { .. } => {
                self.send(ServerMessage::AuthResult {
                    success: true,
                    message: Some("already authenticated".to_string()),
                })
                .await;
            }
            ClientMessage::CreateSession(request) => {
                // session_created is queued by the service ahead of any output
                let result = service.create_session(&self.id, request).await;
                self.report(result).await;
            }
            ClientMessage::CloseSession { session_id } => {
                match service.close_session(&self.id, &session_id).await {
                    Ok(()) => {
                        self.send(ServerMessage::SessionClosed {
                            session_id,
                            reason: "closed by client".to_string(),
                        })
                        .await;
                    }
                    Err(e) => self.send_error(e).await,
                }
            }
            ClientMessage::ResizeSession(request) => {
                let result = service.resize_session(&self.id, &request).await;
                self.report(result).await;
            }
            ClientMessage::ListSessions => {
                let sessions = service.list_sessions(&self.id);
                self.send(ServerMessage::SessionList { sessions }).await;
            }
            ClientMessage::ReconnectSession { session_id } => {
                let result = service.reconnect_session(&self.id, &session_id).await;
                self.report(result).await;
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ServerMessage::Pong { timestamp }).await;
            }
            ClientMessage::GetInfo => {
                self.send(ServerMessage::ServerInfo(service.info())).await;
            }
            ClientMessage::ClipboardCopy { content } => {
                let entry = self.state.clipboard.push(content, &self.id);
                tracing::debug!("Clipboard entry {} from {}", entry.id, self.id);
                self.state.broadcast(ServerMessage::ClipboardUpdated { entry });
            }
            ClientMessage::ClipboardHistory { limit } => {
                let entries = self.state.clipboard.recent(limit.map(|l| l as usize));
                self.send(ServerMessage::ClipboardHistory { entries }).await;
            }
        }
        true
    }

    /// Check the shared token. A wrong token closes the connection.
    async fn authenticate(&mut self, token: &str) -> bool {
        let accepted = match self.state.config.auth_token.as_deref() {
            Some(expected) => tokens_match(token, expected),
            None => true,
        };

        if !accepted {
            tracing::warn!("Authentication failed for {}", self.peer);
            self.send(ServerMessage::AuthResult {
                success: false,
                message: Some("invalid token".to_string()),
            })
            .await;
            return false;
        }

        tracing::info!("Connection {} authenticated", self.id);
        self.authenticated = true;
        self.send(ServerMessage::AuthResult {
            success: true,
            message: None,
        })
        .await;
        self.send_capabilities().await;
        true
    }

    async fn resize(&self, wire_id: SessionId, size: TerminalSize) {
        let result = self.state.service.resize_wire(&self.id, wire_id, size).await;
        self.report(result).await;
    }

    /// A client-sent close frame ends the session it is keyed by
    async fn close_wire(&self, wire_id: SessionId) {
        let Some(session) = self.state.service.registry().get_by_wire_id(wire_id) else {
            self.send_error(RegistryError::NotFound(wire_id.to_string()).into())
                .await;
            return;
        };
        match self.state.service.close_session(&self.id, &session.id).await {
            Ok(()) => {
                self.send(ServerMessage::SessionClosed {
                    session_id: session.id,
                    reason: "closed by client".to_string(),
                })
                .await;
            }
            Err(e) => self.send_error(e).await,
        }
    }

    async fn send_capabilities(&self) {
        let capabilities = self.state.service.capabilities();
        self.send_frame(Frame::connection(FramePayload::Capabilities(capabilities)))
            .await;
    }

    /// Send the error of a failed operation; success needs no reply
    async fn report<T>(&self, result: Result<T, AgentError>) {
        if let Err(e) = result {
            self.send_error(e).await;
        }
    }

    async fn send_error(&self, error: AgentError) {
        tracing::debug!("Request from {} failed: {}", self.id, error);
        let session_id = error.session_id().map(String::from);
        self.send(ServerMessage::error(error.code(), error.to_string(), session_id))
            .await;
    }

    async fn send(&self, message: ServerMessage) {
        match message.to_frame() {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => tracing::error!("Failed to encode control message: {}", e),
        }
    }

    async fn send_frame(&self, frame: Frame) {
        if self.tx.send(frame).await.is_err() {
            tracing::debug!("Writer for {} already closed", self.id);
        }
    }
}

/// Constant-time token comparison
fn tokens_match(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
