//! WebRTC session management
//!
//! The [`SessionManager`] owns every live [`PeerSession`]. Track tasks
//! report their outcome as a [`TrackExit`] to a supervisor task, which
//! tears down only the session whose track failed.
//!
//! ```text
//! on_track -> TrackContext::launch -> run_track ... -> TrackExit
//!                                                         |
//!                                        supervisor <-----+
//!                                            |
//!                        failed track -> close that session only
//! ```

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use super::forwarder::{run_track, ForwardStats, TrackInfo};
use super::peer::{MediaApi, PeerSession, SessionInfo, SessionOrigin};
use super::signaling::SessionDescription;
use crate::config::{AppConfig, DeliveryConfig, ForwarderConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::pipeline::Codec;

/// Outcome of one track, reported to the supervisor
#[derive(Debug)]
pub struct TrackExit {
    pub session_id: String,
    pub track_id: String,
    pub result: Result<ForwardStats>,
}

/// Everything a session needs to launch its inbound tracks
#[derive(Clone)]
pub struct TrackContext {
    forwarder: ForwarderConfig,
    delivery: DeliveryConfig,
    exits: mpsc::UnboundedSender<TrackExit>,
    events: Arc<EventBus>,
}

impl TrackContext {
    /// Spawn the forwarding task for a newly arrived track
    pub(crate) fn launch(
        &self,
        session_id: String,
        track: Arc<TrackRemote>,
        pc: Arc<RTCPeerConnection>,
        cancel: CancellationToken,
        active: Arc<AtomicUsize>,
    ) {
        let ctx = self.clone();

        tokio::spawn(async move {
            let info = TrackInfo::from_remote(&track);

            active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let label = short_id(&session_id);
            let result = run_track(
                label,
                &info,
                &*track,
                pc,
                &ctx.forwarder,
                &ctx.delivery,
                cancel,
                |codec: Codec| {
                    ctx.events.publish(SessionEvent::TrackStarted {
                        session_id: session_id.clone(),
                        track_id: info.id.clone(),
                        codec: codec.name().to_string(),
                        payload_type: info.payload_type,
                        ssrc: info.ssrc,
                    });
                },
            )
            .await;
            active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

            let _ = ctx.exits.send(TrackExit {
                session_id,
                track_id: info.id,
                result,
            });
        });
    }
}

/// First segment of a session id, for log prefixes
fn short_id(session_id: &str) -> &str {
    session_id.split('-').next().unwrap_or(session_id)
}

/// Live sessions plus the bus their lifecycle is announced on
struct Registry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    events: Arc<EventBus>,
}

impl Registry {
    /// Remove and close a session. Returns false if it was already gone.
    async fn remove(&self, session_id: &str, reason: &str) -> bool {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            return false;
        };

        if let Err(e) = session.close().await {
            warn!("Error closing session {}: {}", session_id, e);
        }
        info!("Session {} closed: {}", session_id, reason);

        self.events.publish(SessionEvent::SessionClosed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }
}

/// Session manager and track supervisor
pub struct SessionManager {
    api: Arc<MediaApi>,
    max_sessions: usize,
    tracks: TrackContext,
    registry: Arc<Registry>,
}

impl SessionManager {
    /// Create a manager and spawn its supervisor task
    pub fn new(api: Arc<MediaApi>, config: &AppConfig, events: Arc<EventBus>) -> Arc<Self> {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Registry {
            sessions: RwLock::new(HashMap::new()),
            events: events.clone(),
        });

        tokio::spawn(supervise(registry.clone(), exits_rx));

        Arc::new(Self {
            max_sessions: api.config().max_sessions,
            api,
            tracks: TrackContext {
                forwarder: config.forwarder.clone(),
                delivery: config.delivery.clone(),
                exits: exits_tx,
                events,
            },
            registry,
        })
    }

    /// Create and register a new peer session
    pub async fn create_session(&self, origin: SessionOrigin) -> Result<Arc<PeerSession>> {
        if self.session_count().await >= self.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.max_sessions
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(
            PeerSession::new(&self.api, session_id.clone(), origin, self.tracks.clone()).await?,
        );

        {
            let mut sessions = self.registry.sessions.write().await;
            // Re-check, another request may have raced us while connecting
            if sessions.len() >= self.max_sessions {
                drop(sessions);
                let _ = session.close().await;
                return Err(AppError::ServiceUnavailable(format!(
                    "Maximum sessions ({}) reached",
                    self.max_sessions
                )));
            }
            sessions.insert(session_id.clone(), session.clone());
        }

        self.watch_state(&session);

        info!("Session created: {} ({})", session_id, origin);
        self.registry.events.publish(SessionEvent::SessionCreated {
            session_id,
            origin: origin.to_string(),
            created_at: session.created_at(),
        });

        Ok(session)
    }

    /// Close the session once its peer connection fails or closes
    fn watch_state(&self, session: &Arc<PeerSession>) {
        let registry = self.registry.clone();
        let session_id = session.session_id().to_string();
        let mut state_rx = session.state_watch();

        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                if state.is_terminal() {
                    registry
                        .remove(&session_id, &format!("peer connection {}", state))
                        .await;
                    break;
                }
            }
            debug!("State watcher for session {} finished", session_id);
        });
    }

    /// Create a session and answer `offer` with it.
    ///
    /// A session whose negotiation fails is removed again.
    pub async fn negotiate(
        &self,
        origin: SessionOrigin,
        offer: SessionDescription,
    ) -> Result<(Arc<PeerSession>, SessionDescription)> {
        let session = self.create_session(origin).await?;

        match session
            .accept_offer(offer, self.api.gathering_timeout())
            .await
        {
            Ok(answer) => Ok((session, answer)),
            Err(e) => {
                self.registry
                    .remove(session.session_id(), "negotiation failed")
                    .await;
                Err(e)
            }
        }
    }

    /// Get a session by id
    pub async fn get_session(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.registry.sessions.read().await.get(session_id).cloned()
    }

    /// List all sessions
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.registry.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Close one session
    pub async fn close_session(&self, session_id: &str, reason: &str) -> Result<()> {
        if self.registry.remove(session_id, reason).await {
            Ok(())
        } else {
            Err(AppError::NotFound(format!(
                "Session not found: {}",
                session_id
            )))
        }
    }

    /// Close every session
    pub async fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.registry.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.registry.remove(&id, reason).await;
        }
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.registry.sessions.read().await.len()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.registry.events.clone()
    }
}

/// Receive track exits until every sender is gone
async fn supervise(registry: Arc<Registry>, mut exits: mpsc::UnboundedReceiver<TrackExit>) {
    while let Some(exit) = exits.recv().await {
        let (stats, error) = match &exit.result {
            Ok(stats) => {
                info!(
                    "Track {} of session {} ended: {} packets, {} bytes, {} keyframe requests",
                    exit.track_id, exit.session_id, stats.packets, stats.bytes, stats.keyframe_requests
                );
                (stats.clone(), None)
            }
            Err(e) => {
                warn!(
                    "Track {} of session {} failed: {}",
                    exit.track_id, exit.session_id, e
                );
                (ForwardStats::default(), Some(e.to_string()))
            }
        };

        registry.events.publish(SessionEvent::TrackEnded {
            session_id: exit.session_id.clone(),
            track_id: exit.track_id.clone(),
            packets: stats.packets,
            bytes: stats.bytes,
            error: error.clone(),
        });

        if let Some(error) = error {
            registry
                .remove(
                    &exit.session_id,
                    &format!("track {} failed: {}", exit.track_id, error),
                )
                .await;
        }
    }

    debug!("Track supervisor stopped");
}
