//! Agent state management

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use pt_core::config::AgentConfig;
use pt_protocol::ServerMessage;

use crate::clipboard::ClipboardHistory;
use crate::session::SessionService;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Global state for the agent daemon
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Sessions and backends
    pub service: Arc<SessionService>,
    /// Clipboard history shared by all connections
    pub clipboard: ClipboardHistory,
    /// Events sent to every connection
    pub events: broadcast::Sender<ServerMessage>,
    /// Cancelled on agent shutdown
    pub cancel: CancellationToken,
}

impl AgentState {
    /// Create new agent state
    pub fn new(service: Arc<SessionService>, cancel: CancellationToken) -> Self {
        let config = service.config().clone();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clipboard: ClipboardHistory::new(config.clipboard_history_limit),
            config,
            service,
            events,
            cancel,
        }
    }

    /// Send an event to every connected client
    pub fn broadcast(&self, event: ServerMessage) {
        // No receivers just means no clients are connected
        let _ = self.events.send(event);
    }
}
