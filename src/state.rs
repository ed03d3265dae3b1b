use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::webrtc::SessionManager;

/// Application-wide state shared across handlers
///
/// Everything that touches a peer connection goes through `sessions`; the
/// WebRTC API object lives inside it and is never global.
pub struct AppState {
    /// Effective configuration (file + CLI overrides)
    pub config: AppConfig,
    /// Peer session manager
    pub sessions: Arc<SessionManager>,
    /// Event bus for session lifecycle notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: AppConfig,
        sessions: Arc<SessionManager>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
