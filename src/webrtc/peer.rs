//! WebRTC peer connection management

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::config::{CodecSet, WebRtcConfig};
use super::session::TrackContext;
use super::signaling::{ConnectionState, SessionDescription};
use crate::error::{AppError, Result};

/// Media API shared by every peer connection of a process
///
/// Built once at startup and handed around in an `Arc`.
pub struct MediaApi {
    api: API,
    config: WebRtcConfig,
    codecs: CodecSet,
}

impl MediaApi {
    /// Build the media engine, interceptors and API
    pub fn new(config: &WebRtcConfig, codecs: CodecSet) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        match codecs {
            CodecSet::Browser => register_browser_codecs(&mut media_engine)?,
            CodecSet::Default => media_engine
                .register_default_codecs()
                .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?,
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("WebRTC media API ready ({:?} codecs)", codecs);

        Ok(Self {
            api,
            config: config.clone(),
            codecs,
        })
    }

    /// Create a new peer connection using the configured ICE servers
    pub async fn new_peer_connection(&self) -> Result<RTCPeerConnection> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };

        self.api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create peer connection: {}", e)))
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }

    pub fn codecs(&self) -> CodecSet {
        self.codecs
    }

    /// Upper bound on waiting for ICE gathering
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.config.gathering_timeout_ms)
    }
}

/// H.264 (pt 96) and Opus (pt 111) only
fn register_browser_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| AppError::WebRtcError(format!("Failed to register H264 codec: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| AppError::WebRtcError(format!("Failed to register Opus codec: {}", e)))?;

    Ok(())
}

/// Which bootstrap created a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Http,
    Janus,
}

impl std::fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOrigin::Http => write!(f, "http"),
            SessionOrigin::Janus => write!(f, "janus"),
        }
    }
}

/// Session summary for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub origin: SessionOrigin,
    pub state: ConnectionState,
    pub tracks: usize,
    pub created_at: DateTime<Utc>,
    pub age_secs: i64,
}

/// One receiving peer connection and the tracks it carries
#[derive(Debug)]
pub struct PeerSession {
    session_id: String,
    origin: SessionOrigin,
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Parent of every track token of this session
    cancel: CancellationToken,
    active_tracks: Arc<AtomicUsize>,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    /// Create a peer connection whose inbound tracks are launched with `tracks`
    pub async fn new(
        api: &MediaApi,
        session_id: String,
        origin: SessionOrigin,
        tracks: TrackContext,
    ) -> Result<Self> {
        let pc = Arc::new(api.new_peer_connection().await?);
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        let session = Self {
            session_id,
            origin,
            pc,
            state_rx,
            cancel: CancellationToken::new(),
            active_tracks: Arc::new(AtomicUsize::new(0)),
            created_at: Utc::now(),
        };

        session.setup_event_handlers(Arc::new(state_tx), tracks);
        Ok(session)
    }

    fn setup_event_handlers(&self, state: Arc<watch::Sender<ConnectionState>>, tracks: TrackContext) {
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", session_id, new_state);
                    let _ = state.send(new_state);
                })
            }));

        let session_id = self.session_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                info!("Peer {} ICE connection state has changed: {}", session_id, s);
                Box::pin(async {})
            }));

        // Weak reference: the handler is owned by the peer connection itself
        let pc = Arc::downgrade(&self.pc);
        let session_id = self.session_id.clone();
        let cancel = self.cancel.clone();
        let active = self.active_tracks.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                debug!(
                    "Peer {} new inbound track {}",
                    session_id,
                    track.codec().capability.mime_type
                );

                match pc.upgrade() {
                    Some(pc) => tracks.launch(
                        session_id.clone(),
                        track,
                        pc,
                        cancel.child_token(),
                        active.clone(),
                    ),
                    None => warn!("Peer {} gone before track arrived", session_id),
                }
                Box::pin(async {})
            },
        ));
    }

    /// Apply a remote offer and produce the local answer.
    ///
    /// Waits for ICE gathering so the answer carries every candidate, but no
    /// longer than `gathering_timeout`.
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
        gathering_timeout: Duration,
    ) -> Result<SessionDescription> {
        let offer = offer.into_rtc_offer()?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "Peer {} ICE gathering not complete after {:?}, answering with partial candidates",
                self.session_id, gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;

        debug!("Peer {} answer:\n{}", self.session_id, local.sdp);
        SessionDescription::from_rtc(&local)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Number of tracks currently forwarding
    pub fn active_tracks(&self) -> usize {
        self.active_tracks.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            origin: self.origin,
            state: self.state(),
            tracks: self.active_tracks(),
            created_at: self.created_at,
            age_secs: (Utc::now() - self.created_at).num_seconds(),
        }
    }

    /// Cancel every track of this session and close the peer connection
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}
