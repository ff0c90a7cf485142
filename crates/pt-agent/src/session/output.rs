//! Session output routing
//!
//! One blocking pump per session reads the backend's output and hands it
//! to the router, which forwards it to whichever connection currently owns
//! the session. While nobody owns it, the tail of the output is kept in a
//! bounded replay buffer and flushed when a connection attaches.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pt_core::ConnectionId;
use pt_protocol::{Frame, SessionId};

/// Read size for session output
pub const READ_CHUNK_SIZE: usize = 4096;

/// Output retained for a session without an owner
pub const REPLAY_LIMIT: usize = 64 * 1024;

/// How long control frames and replay wait for room in a connection's queue
pub const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A session's output stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub session_id: String,
}

struct Route {
    wire_id: SessionId,
    connection: Option<ConnectionId>,
    replay: BytesMut,
}

impl Route {
    fn buffer(&mut self, data: &[u8]) {
        self.replay.extend_from_slice(data);
        self.trim();
    }

    /// Put unsent output back ahead of anything buffered since
    fn restore(&mut self, unsent: &[u8]) {
        let mut replay = BytesMut::with_capacity(unsent.len() + self.replay.len());
        replay.extend_from_slice(unsent);
        replay.extend_from_slice(&self.replay);
        self.replay = replay;
        self.trim();
    }

    fn trim(&mut self) {
        if self.replay.len() > REPLAY_LIMIT {
            let excess = self.replay.len() - REPLAY_LIMIT;
            let _ = self.replay.split_to(excess);
        }
    }
}

fn data_frames(wire_id: SessionId, data: &[u8]) -> Vec<Frame> {
    data.chunks(READ_CHUNK_SIZE)
        .map(|chunk| Frame::data(wire_id, Bytes::copy_from_slice(chunk)))
        .collect()
}

/// Queue `frames` in order, giving up if the receiver closes or stops
/// draining for [`CONTROL_SEND_TIMEOUT`]
async fn send_all(tx: &mpsc::Sender<Frame>, frames: impl IntoIterator<Item = Frame>) -> bool {
    for frame in frames {
        match tokio::time::timeout(CONTROL_SEND_TIMEOUT, tx.send(frame)).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
    }
    true
}

pub struct OutputRouter {
    connections: DashMap<ConnectionId, mpsc::Sender<Frame>>,
    routes: DashMap<String, Route>,
    exits: mpsc::UnboundedSender<SessionExit>,
}

impl OutputRouter {
    /// Create a router and the receiver for end-of-stream notifications
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let router = Self {
            connections: DashMap::new(),
            routes: DashMap::new(),
            exits,
        };
        (router, exit_rx)
    }

    pub fn register_connection(&self, connection: ConnectionId, tx: mpsc::Sender<Frame>) {
        self.connections.insert(connection, tx);
    }

    pub fn unregister_connection(&self, connection: &ConnectionId) {
        self.connections.remove(connection);
    }

    /// Queue a frame for a connection, waiting for room in its queue.
    /// False if it is gone or stopped draining.
    pub async fn send_to(&self, connection: &ConnectionId, frame: Frame) -> bool {
        let Some(tx) = self.connections.get(connection).map(|tx| tx.clone()) else {
            return false;
        };
        let sent = send_all(&tx, [frame]).await;
        if !sent {
            tracing::warn!("Dropping control frame for {}: queue not draining", connection);
        }
        sent
    }

    /// Start routing a session. Output is buffered until [`Self::attach`].
    pub fn add_route(&self, session_id: &str, wire_id: SessionId) {
        self.routes.insert(
            session_id.to_string(),
            Route {
                wire_id,
                connection: None,
                replay: BytesMut::new(),
            },
        );
    }

    pub fn has_route(&self, session_id: &str) -> bool {
        self.routes.contains_key(session_id)
    }

    /// Make `connection` the session's output destination.
    ///
    /// `announce` receives the number of buffered bytes and returns the
    /// frames to queue ahead of them, so a client always learns about a
    /// session before it sees its output. Returns the replayed byte count.
    ///
    /// The route stays ownerless while the backlog is queued; output that
    /// arrives meanwhile is buffered and drained before live forwarding
    /// starts. If the connection stops draining, the unsent bytes go back
    /// into the replay buffer.
    pub async fn attach<F>(&self, session_id: &str, connection: &ConnectionId, announce: F) -> usize
    where
        F: FnOnce(usize) -> Vec<Frame>,
    {
        let Some(tx) = self.connections.get(connection).map(|tx| tx.clone()) else {
            tracing::debug!("Connection {} is gone, not attaching {}", connection, session_id);
            return 0;
        };
        let (wire_id, backlog) = {
            let Some(mut route) = self.routes.get_mut(session_id) else {
                return 0;
            };
            route.connection = None;
            (route.wire_id, route.replay.split().freeze())
        };

        let mut batch = announce(backlog.len());
        batch.extend(data_frames(wire_id, &backlog));
        let mut pending = backlog;
        let mut replayed = 0;

        loop {
            if !send_all(&tx, batch).await {
                tracing::warn!(
                    "Outbound queue of {} not draining while attaching {}",
                    connection,
                    session_id
                );
                if let Some(mut route) = self.routes.get_mut(session_id) {
                    route.restore(&pending);
                }
                return replayed;
            }
            replayed += pending.len();

            // Claim the route only once nothing is left to replay
            pending = {
                let Some(mut route) = self.routes.get_mut(session_id) else {
                    return replayed;
                };
                if route.replay.is_empty() {
                    route.connection = Some(connection.clone());
                    break;
                }
                route.replay.split().freeze()
            };
            batch = data_frames(wire_id, &pending);
        }

        tracing::debug!(
            "Session {} attached to {} ({} bytes replayed)",
            session_id,
            connection,
            replayed
        );
        replayed
    }

    /// Stop forwarding and start buffering
    pub fn detach(&self, session_id: &str) {
        if let Some(mut route) = self.routes.get_mut(session_id) {
            route.connection = None;
        }
    }

    /// Forget a session; its pump stops at the next read
    pub fn remove(&self, session_id: &str) {
        self.routes.remove(session_id);
    }

    /// Remove the route and tell the owner the session ended.
    ///
    /// Returns the owning connection, if one was attached.
    pub async fn close(&self, session_id: &str, exit_code: Option<i32>) -> Option<ConnectionId> {
        let (_, route) = self.routes.remove(session_id)?;
        let connection = route.connection?;
        self.send_to(&connection, Frame::session_closed(route.wire_id, exit_code))
            .await;
        Some(connection)
    }

    /// Forward one chunk of output. False once the route is gone.
    fn deliver(&self, session_id: &str, data: &[u8]) -> bool {
        let target = {
            let Some(mut route) = self.routes.get_mut(session_id) else {
                return false;
            };
            let tx = route
                .connection
                .as_ref()
                .and_then(|c| self.connections.get(c).map(|tx| tx.clone()));
            match tx {
                Some(tx) => Some((tx, route.wire_id)),
                None => {
                    route.buffer(data);
                    None
                }
            }
        };

        if let Some((tx, wire_id)) = target {
            let frame = Frame::data(wire_id, Bytes::copy_from_slice(data));
            if tx.blocking_send(frame).is_err() {
                // Connection went away between lookup and send
                if let Some(mut route) = self.routes.get_mut(session_id) {
                    route.buffer(data);
                }
            }
        }
        true
    }

    /// Pump `reader` into the router on a blocking thread until the stream
    /// ends or the route is removed
    pub fn spawn_pump(self: &Arc<Self>, session_id: String, mut reader: Box<dyn Read + Send>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("Output of session {} reached EOF", session_id);
                        break;
                    }
                    Ok(n) => {
                        if !router.deliver(&session_id, &buf[..n]) {
                            tracing::debug!("Route for session {} removed, stopping pump", session_id);
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how a PTY reports that the child side closed
                        tracing::debug!("Output of session {} ended: {}", session_id, e);
                        break;
                    }
                }
            }

            if router.has_route(&session_id) {
                let _ = router.exits.send(SessionExit { session_id });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_protocol::FramePayload;
    use std::io::Cursor;

    fn data_of(frame: &Frame) -> &[u8] {
        match &frame.payload {
            FramePayload::Data(data) => data.as_ref(),
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buffers_until_attached() {
        let (router, mut exits) = OutputRouter::new();
        let router = Arc::new(router);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = ConnectionId::from("c1");
        router.register_connection(conn.clone(), tx);

        router.add_route("s1", SessionId::new(7));
        router
            .spawn_pump("s1".to_string(), Box::new(Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();
        assert_eq!(exits.recv().await.unwrap().session_id, "s1");

        let replayed = router
            .attach("s1", &conn, |n| {
                vec![Frame::connection(FramePayload::Control(format!("replay {}", n)))]
            })
            .await;
        assert_eq!(replayed, 5);

        let announce = rx.recv().await.unwrap();
        assert_eq!(announce.payload, FramePayload::Control("replay 5".to_string()));
        let data = rx.recv().await.unwrap();
        assert_eq!(data.session_id, SessionId::new(7));
        assert_eq!(data_of(&data), b"hello");
    }

    #[tokio::test]
    async fn test_live_output_goes_to_owner() {
        let (router, _exits) = OutputRouter::new();
        let router = Arc::new(router);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = ConnectionId::from("c1");
        router.register_connection(conn.clone(), tx);
        router.add_route("s1", SessionId::new(1));
        assert_eq!(router.attach("s1", &conn, |_| vec![]).await, 0);

        router
            .spawn_pump("s1".to_string(), Box::new(Cursor::new(b"live".to_vec())))
            .await
            .unwrap();
        assert_eq!(data_of(&rx.recv().await.unwrap()), b"live");

        assert_eq!(router.close("s1", Some(0)).await, Some(conn));
        let closed = rx.recv().await.unwrap();
        assert_eq!(closed.payload, FramePayload::SessionClosed { exit_code: Some(0) });
        assert!(!router.has_route("s1"));
    }

    #[test]
    fn test_replay_keeps_tail() {
        let mut route = Route {
            wire_id: SessionId::new(1),
            connection: None,
            replay: BytesMut::new(),
        };
        route.buffer(&vec![b'a'; REPLAY_LIMIT]);
        route.buffer(b"tail");
        assert_eq!(route.replay.len(), REPLAY_LIMIT);
        assert!(route.replay.ends_with(b"tail"));
    }

    #[test]
    fn test_restore_puts_unsent_output_first() {
        let mut route = Route {
            wire_id: SessionId::new(1),
            connection: None,
            replay: BytesMut::new(),
        };
        route.buffer(b"later");
        route.restore(b"first ");
        assert_eq!(&route.replay[..], b"first later");
    }

    #[tokio::test]
    async fn test_full_queue_does_not_drop_replay_or_close() {
        let (router, mut exits) = OutputRouter::new();
        let router = Arc::new(router);
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ConnectionId::from("c1");
        router.register_connection(conn.clone(), tx);

        router.add_route("s1", SessionId::new(3));
        router
            .spawn_pump("s1".to_string(), Box::new(Cursor::new(vec![b'z'; 8192])))
            .await
            .unwrap();
        exits.recv().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            frames
        });

        let replayed = router
            .attach("s1", &conn, |_| {
                vec![Frame::connection(FramePayload::Control("created".to_string()))]
            })
            .await;
        assert_eq!(replayed, 8192);
        assert_eq!(router.close("s1", None).await, Some(conn.clone()));
        router.unregister_connection(&conn);

        let frames = reader.await.unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].payload, FramePayload::Control("created".to_string()));
        assert_eq!(data_of(&frames[1]).len() + data_of(&frames[2]).len(), 8192);
        assert_eq!(frames[3].payload, FramePayload::SessionClosed { exit_code: None });
    }

    #[tokio::test]
    async fn test_removed_route_stops_pump_silently() {
        let (router, mut exits) = OutputRouter::new();
        let router = Arc::new(router);
        router
            .spawn_pump("gone".to_string(), Box::new(Cursor::new(b"x".to_vec())))
            .await
            .unwrap();
        assert!(exits.try_recv().is_err());
    }
}
