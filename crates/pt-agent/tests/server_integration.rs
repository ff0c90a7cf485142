//! Server integration tests
//!
//! Runs the listener on an ephemeral port and talks to it with the frame
//! codec, the way a client does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use pt_agent::backend::{BackendSet, NativeBackend};
use pt_agent::server::Listener;
use pt_agent::session::SessionService;
use pt_agent::AgentState;
use pt_core::config::AgentConfig;
use pt_protocol::{
    ClientMessage, CreateSessionRequest, ErrorCode, Frame, FrameCodec, FramePayload,
    MultiplexerType, ServerMessage, SessionSummary,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: AgentConfig) -> Self {
        let mut backends = BackendSet::empty();
        backends.register(Arc::new(NativeBackend::new()));
        let (service, _exits) = SessionService::new(config, backends);

        let cancel = CancellationToken::new();
        let state = Arc::new(AgentState::new(Arc::new(service), cancel.clone()));
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(Listener::new(state).run(socket));

        Self {
            addr,
            cancel,
            handle,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = timeout(Duration::from_secs(15), self.handle).await;
    }
}

struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }

    /// Connect and consume the greeting of an unauthenticated server
    async fn connect_ready(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        assert!(matches!(client.recv_control().await, ServerMessage::Connected { .. }));
        assert!(matches!(client.recv().await.payload, FramePayload::Capabilities(_)));
        client
    }

    async fn send(&mut self, message: ClientMessage) {
        self.framed.send(message.to_frame().unwrap()).await.unwrap();
    }

    async fn send_raw(&mut self, json: &str) {
        let frame = Frame::connection(FramePayload::Control(json.to_string()));
        self.framed.send(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Connection closed")
            .expect("Invalid frame")
    }

    /// Next control message, skipping session output
    async fn recv_control(&mut self) -> ServerMessage {
        loop {
            let frame = self.recv().await;
            if let FramePayload::Control(text) = frame.payload {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    #[cfg(unix)]
    async fn create_sh(&mut self) -> SessionSummary {
        let request = CreateSessionRequest::new(80, 24)
            .unwrap()
            .with_shell("/bin/sh")
            .unwrap();
        self.send(ClientMessage::CreateSession(request)).await;
        match self.recv_control().await {
            ServerMessage::SessionCreated { session } => session,
            other => panic!("Expected session_created, got {:?}", other),
        }
    }
}

fn error_code(message: &ServerMessage) -> ErrorCode {
    match message {
        ServerMessage::Error { code, .. } => *code,
        other => panic!("Expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_greeting_and_capabilities() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect(server.addr).await;

    match client.recv_control().await {
        ServerMessage::Connected {
            connection_id,
            requires_auth,
            ..
        } => {
            assert!(!connection_id.is_empty());
            assert!(!requires_auth);
        }
        other => panic!("Expected connected, got {:?}", other),
    }

    match client.recv().await.payload {
        FramePayload::Capabilities(capabilities) => {
            let native = capabilities
                .backends
                .iter()
                .find(|b| b.multiplexer_type == MultiplexerType::Native)
                .expect("native backend listed");
            assert!(native.available);
        }
        other => panic!("Expected capabilities, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_ping_and_info() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect_ready(server.addr).await;

    client.send(ClientMessage::Ping { timestamp: 42 }).await;
    assert_eq!(client.recv_control().await, ServerMessage::Pong { timestamp: 42 });

    client.send(ClientMessage::GetInfo).await;
    match client.recv_control().await {
        ServerMessage::ServerInfo(info) => {
            assert_eq!(info.protocol_version, pt_protocol::PROTOCOL_VERSION);
            assert!(!info.hostname.is_empty());
        }
        other => panic!("Expected server_info, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_request_keeps_connection() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect_ready(server.addr).await;

    client
        .send_raw(r#"{"v":1,"type":"create_session","columns":0,"rows":24}"#)
        .await;
    assert_eq!(error_code(&client.recv_control().await), ErrorCode::InvalidRequest);

    client.send_raw(r#"{"v":2,"type":"ping","timestamp":1}"#).await;
    assert_eq!(error_code(&client.recv_control().await), ErrorCode::InvalidRequest);

    client.send(ClientMessage::Ping { timestamp: 1 }).await;
    assert_eq!(client.recv_control().await, ServerMessage::Pong { timestamp: 1 });

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect_ready(server.addr).await;

    client
        .send(ClientMessage::close_session("missing").unwrap())
        .await;
    match client.recv_control().await {
        ServerMessage::Error {
            code, session_id, ..
        } => {
            assert_eq!(code, ErrorCode::SessionNotFound);
            assert_eq!(session_id.as_deref(), Some("missing"));
        }
        other => panic!("Expected error, got {:?}", other),
    }

    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_session_lifecycle_over_tcp() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect_ready(server.addr).await;

    let session = client.create_sh().await;
    assert_eq!(session.columns, 80);

    client
        .framed
        .send(Frame::data(
            pt_protocol::SessionId::new(session.wire_id),
            &b"echo pocket-$((40+2))\n"[..],
        ))
        .await
        .unwrap();

    let mut output = Vec::new();
    while !String::from_utf8_lossy(&output).contains("pocket-42") {
        let frame = client.recv().await;
        if let FramePayload::Data(data) = frame.payload {
            assert_eq!(frame.session_id.as_u32(), session.wire_id);
            output.extend_from_slice(&data);
        }
    }

    client.send(ClientMessage::ListSessions).await;
    match client.recv_control().await {
        ServerMessage::SessionList { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].id, session.id);
        }
        other => panic!("Expected session_list, got {:?}", other),
    }

    client
        .send(ClientMessage::close_session(session.id.clone()).unwrap())
        .await;
    match client.recv_control().await {
        ServerMessage::SessionClosed { session_id, .. } => assert_eq!(session_id, session.id),
        other => panic!("Expected session_closed, got {:?}", other),
    }

    server.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_reconnect_from_new_connection() {
    let server = TestServer::start(AgentConfig::default()).await;

    let session = {
        let mut first = TestClient::connect_ready(server.addr).await;
        first.create_sh().await
    };

    let mut second = TestClient::connect_ready(server.addr).await;
    // The first connection's drop is processed asynchronously
    let mut reconnected = None;
    for _ in 0..50 {
        second
            .send(ClientMessage::reconnect_session(session.id.clone()).unwrap())
            .await;
        match second.recv_control().await {
            ServerMessage::SessionReconnected { session, .. } => {
                reconnected = Some(session);
                break;
            }
            ServerMessage::Error {
                code: ErrorCode::InvalidState,
                ..
            } => tokio::time::sleep(Duration::from_millis(20)).await,
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    let reconnected = reconnected.expect("session reconnected");
    assert_eq!(reconnected.id, session.id);
    assert_eq!(reconnected.reconnect_count, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_authentication_required() {
    let config = AgentConfig {
        auth_token: Some("s3cret".to_string()),
        ..AgentConfig::default()
    };
    let server = TestServer::start(config).await;

    let mut client = TestClient::connect(server.addr).await;
    match client.recv_control().await {
        ServerMessage::Connected { requires_auth, .. } => assert!(requires_auth),
        other => panic!("Expected connected, got {:?}", other),
    }

    client.send(ClientMessage::ListSessions).await;
    assert_eq!(error_code(&client.recv_control().await), ErrorCode::AuthFailed);

    client
        .send(ClientMessage::authenticate("s3cret").unwrap())
        .await;
    match client.recv_control().await {
        ServerMessage::AuthResult { success, .. } => assert!(success),
        other => panic!("Expected auth_result, got {:?}", other),
    }
    assert!(matches!(client.recv().await.payload, FramePayload::Capabilities(_)));

    client.send(ClientMessage::ListSessions).await;
    assert!(matches!(
        client.recv_control().await,
        ServerMessage::SessionList { .. }
    ));

    let mut intruder = TestClient::connect(server.addr).await;
    intruder.recv_control().await;
    intruder
        .send(ClientMessage::authenticate("wrong").unwrap())
        .await;
    match intruder.recv_control().await {
        ServerMessage::AuthResult { success, .. } => assert!(!success),
        other => panic!("Expected auth_result, got {:?}", other),
    }
    assert!(intruder.is_closed().await);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let config = AgentConfig {
        max_connections: 1,
        ..AgentConfig::default()
    };
    let server = TestServer::start(config).await;

    let _first = TestClient::connect_ready(server.addr).await;
    let mut second = TestClient::connect(server.addr).await;
    assert_eq!(error_code(&second.recv_control().await), ErrorCode::ConnectionLimit);
    assert!(second.is_closed().await);

    server.stop().await;
}

#[tokio::test]
async fn test_clipboard_is_broadcast() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut alice = TestClient::connect_ready(server.addr).await;
    let mut bob = TestClient::connect_ready(server.addr).await;

    alice
        .send(ClientMessage::clipboard_copy("copied text").unwrap())
        .await;
    for client in [&mut alice, &mut bob] {
        match client.recv_control().await {
            ServerMessage::ClipboardUpdated { entry } => assert_eq!(entry.content, "copied text"),
            other => panic!("Expected clipboard_updated, got {:?}", other),
        }
    }

    bob.send(ClientMessage::ClipboardHistory { limit: Some(5) })
        .await;
    match bob.recv_control().await {
        ServerMessage::ClipboardHistory { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].content, "copied text");
        }
        other => panic!("Expected clipboard_history, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_notifies_clients() {
    let server = TestServer::start(AgentConfig::default()).await;
    let mut client = TestClient::connect_ready(server.addr).await;

    server.cancel.cancel();
    assert!(matches!(
        client.recv_control().await,
        ServerMessage::ServerShutdown { .. }
    ));
    assert!(client.is_closed().await);

    let _ = timeout(Duration::from_secs(15), server.handle).await;
}
