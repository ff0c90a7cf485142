//! TCP accept loop
//!
//! Transport security is terminated in front of the agent; connections
//! arrive here as plain TCP carrying frames.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::FramedWrite;

use pt_core::AgentError;
use pt_protocol::{FrameCodec, ServerMessage};

use super::handler::handle_connection;
use crate::state::AgentState;

/// How long open connections get to wind down after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Write timeout for the rejection sent to over-limit connections
const REJECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Accepts client connections and spawns a handler for each
pub struct Listener {
    state: Arc<AgentState>,
    permits: Arc<Semaphore>,
}

impl Listener {
    pub fn new(state: Arc<AgentState>) -> Self {
        let permits = Arc::new(Semaphore::new(state.config.max_connections));
        Self { state, permits }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = &self.state.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the agent is cancelled, then wait for the
    /// open ones to finish
    pub async fn run(self, listener: TcpListener) {
        let cancel = self.state.cancel.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        match Arc::clone(&self.permits).try_acquire_owned() {
                            Ok(permit) => {
                                tracing::info!("New connection from {}", peer);
                                let state = Arc::clone(&self.state);
                                connections.spawn(async move {
                                    handle_connection(stream, peer, state).await;
                                    drop(permit);
                                });
                            }
                            Err(_) => {
                                tracing::warn!(
                                    "Rejecting connection from {}: {} connections open",
                                    peer,
                                    self.state.config.max_connections
                                );
                                connections.spawn(reject(stream, self.state.config.max_connections));
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                    }
                },

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Aborting {} connections that did not close in time", connections.len());
            connections.abort_all();
        }
    }
}

/// Tell an over-limit client why it is being dropped
async fn reject(stream: TcpStream, max: usize) {
    let error = AgentError::ConnectionLimit { max };
    let message = ServerMessage::error(error.code(), error.to_string(), None);
    let frame = match message.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Failed to encode rejection: {}", e);
            return;
        }
    };

    let mut writer = FramedWrite::new(stream, FrameCodec::new());
    let sent = tokio::time::timeout(REJECT_TIMEOUT, async {
        writer.send(frame).await?;
        writer.close().await
    })
    .await;
    if let Ok(Err(e)) = sent {
        tracing::debug!("Failed to send rejection: {}", e);
    }
}
