//! WebRTC configuration

use serde::{Deserialize, Serialize};
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Upper bound on waiting for ICE gathering before answering (ms)
    pub gathering_timeout_ms: u64,
    /// Maximum concurrent peer sessions
    pub max_sessions: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough for local connections
            stun_servers: vec![],
            turn_servers: vec![],
            gathering_timeout_ms: 5000,
            max_sessions: 8,
        }
    }
}

impl WebRtcConfig {
    /// ICE servers for a new peer connection
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            // webrtc-rs rejects TURN servers without credentials
            if turn.username.is_empty() || turn.credential.is_empty() {
                warn!(
                    "Skipping TURN server {:?} - credentials required but missing",
                    turn.urls
                );
                continue;
            }
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Codecs offered by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecSet {
    /// H.264 (pt 96) and Opus (pt 111), what the browser demo page sends
    #[default]
    Browser,
    /// Every codec the webrtc crate registers by default
    Default,
}
