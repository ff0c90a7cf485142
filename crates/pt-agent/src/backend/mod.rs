//! Terminal backends
//!
//! Every backend implements [`TerminalBackend`]; the [`BackendSet`] holds
//! one instance per multiplexer type and is the only place that knows the
//! concrete types.

mod command;
mod native;
mod screen;
mod tmux;

use std::collections::HashMap;
use std::sync::Arc;

use pt_core::{BackendError, TerminalBackend};
use pt_protocol::{BackendDescriptor, MultiplexerType};

pub use native::NativeBackend;
pub use screen::ScreenBackend;
pub use tmux::TmuxBackend;

/// The backends an agent can create sessions with
pub struct BackendSet {
    backends: HashMap<MultiplexerType, Arc<dyn TerminalBackend>>,
}

impl BackendSet {
    /// Native, tmux and screen backends, not yet initialized
    pub fn new() -> Self {
        let mut set = Self::empty();
        set.register(Arc::new(NativeBackend::new()));
        set.register(Arc::new(TmuxBackend::new()));
        set.register(Arc::new(ScreenBackend::new()));
        set
    }

    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Add or replace the backend for its multiplexer type
    pub fn register(&mut self, backend: Arc<dyn TerminalBackend>) {
        self.backends.insert(backend.multiplexer_type(), backend);
    }

    /// Initialize every backend; missing multiplexers are logged, not fatal
    pub async fn initialize_all(&self) {
        for backend in self.backends.values() {
            let mt = backend.multiplexer_type();
            match backend.initialize().await {
                Ok(()) => tracing::debug!("{} backend initialized", mt),
                Err(BackendError::Unavailable(_)) => {
                    tracing::info!("{} backend unavailable on this host", mt);
                }
                Err(e) => tracing::warn!("Failed to initialize {} backend: {}", mt, e),
            }
        }
    }

    /// Backend for `multiplexer`, if it is registered and available
    pub fn get(&self, multiplexer: MultiplexerType) -> Result<Arc<dyn TerminalBackend>, BackendError> {
        let backend = self
            .backends
            .get(&multiplexer)
            .ok_or(BackendError::Unavailable(multiplexer))?;
        if !backend.is_available() {
            return Err(BackendError::NotInitialized(multiplexer));
        }
        Ok(Arc::clone(backend))
    }

    /// Availability and capabilities of every registered backend, in
    /// multiplexer code order
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let mut descriptors: Vec<BackendDescriptor> = self
            .backends
            .values()
            .map(|backend| BackendDescriptor {
                multiplexer_type: backend.multiplexer_type(),
                available: backend.is_available(),
                capabilities: backend.capabilities(),
            })
            .collect();
        descriptors.sort_by_key(|d| d.multiplexer_type.as_u8());
        descriptors
    }

    pub async fn shutdown_all(&self) {
        for backend in self.backends.values() {
            backend.shutdown().await;
        }
    }
}

impl Default for BackendSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_always_available() {
        let backends = BackendSet::new();
        backends.initialize_all().await;

        assert!(backends.get(MultiplexerType::Native).is_ok());

        let descriptors = backends.descriptors();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].multiplexer_type, MultiplexerType::Native);
        assert!(descriptors[0].available);
        assert!(!descriptors[0].capabilities.persistence);
        assert!(descriptors[1].capabilities.persistence);
        assert!(descriptors[2].capabilities.attach);

        backends.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_uninitialized_backend_is_rejected() {
        let backends = BackendSet::new();
        assert!(matches!(
            backends.get(MultiplexerType::Tmux),
            Err(BackendError::NotInitialized(MultiplexerType::Tmux))
        ));
        assert!(matches!(
            BackendSet::empty().get(MultiplexerType::Native),
            Err(BackendError::Unavailable(MultiplexerType::Native))
        ));
    }
}
