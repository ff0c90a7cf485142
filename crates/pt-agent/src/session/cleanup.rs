//! Expiry sweep for disconnected sessions
//!
//! Sessions left behind by a dropped connection stay reconnectable for the
//! configured window. This task periodically removes the ones whose window
//! has passed and stops their processes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::service::SessionService;

/// Run the expiry sweep every `interval` until cancelled
pub async fn run_expiry_sweep(service: Arc<SessionService>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; nothing can have expired yet
    ticker.tick().await;

    tracing::info!(
        "Starting session expiry sweep (window: {} min, check interval: {:?})",
        service.config().reconnection_window_minutes,
        interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = service.sweep_expired().await;
                if removed > 0 {
                    let stats = service.statistics();
                    tracing::info!(
                        "Expired {} sessions ({} remaining, {} disconnected)",
                        removed,
                        stats.total_sessions,
                        stats.disconnected_sessions
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Session expiry sweep shutting down");
                break;
            }
        }
    }
}
